//! HaLow MAC simulation binary
//!
//! This is a small closed-loop demonstration of the channel access engine.
//! A handful of stations share one propagation-delayed medium, each sends a
//! stream of packets to its ring neighbor, and the simulator reports what
//! was delivered, retried and dropped. Receptions can be degraded with a
//! configurable noise loss rate, and overlapping transmissions collide.

use clap::{Arg, Command};
use halow_mac::engine::{
    FixedPowerController, FixedRateController, MacAction, MacConfig, MacEngine, NodeIdResolver,
    TxParameters,
};
use halow_mac::{FrameBuffer, MacError, NetworkAddress, Result, SimTime, SECOND, ZERO_TIME};
use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::process;

/// Default number of stations on the shared medium
const DEFAULT_NODE_COUNT: &str = "2";

/// Default number of packets each station offers
const DEFAULT_PACKET_COUNT: &str = "50";

/// Default payload size in bytes
const DEFAULT_PAYLOAD_BYTES: &str = "200";

/// Default gap between packet arrivals at one station, in microseconds
const DEFAULT_ARRIVAL_INTERVAL_US: &str = "5000";

/// Default data rate in bits per second
const DEFAULT_DATA_RATE: &str = "650000";

/// Default share of receptions lost to noise, in percent
const DEFAULT_LOSS_PERCENT: &str = "0";

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

const ETHERTYPE_IPV4: u16 = 0x0800;

/// Hard cap on simulated time, in case a configuration never settles
const SIM_HORIZON: SimTime = 120 * SECOND;

fn main() -> Result<()> {
    let matches = Command::new("halow-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Closed-loop demonstration of the 802.11ah channel access engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("MAC configuration file (JSON or TOML)"),
        )
        .arg(
            Arg::new("nodes")
                .short('n')
                .long("nodes")
                .value_name("COUNT")
                .help("Number of stations on the medium")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_NODE_COUNT),
        )
        .arg(
            Arg::new("packets")
                .short('p')
                .long("packets")
                .value_name("COUNT")
                .help("Packets offered by each station")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_PACKET_COUNT),
        )
        .arg(
            Arg::new("payload-bytes")
                .long("payload-bytes")
                .value_name("BYTES")
                .help("Payload size of each packet")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_PAYLOAD_BYTES),
        )
        .arg(
            Arg::new("interval-us")
                .long("interval-us")
                .value_name("MICROSECONDS")
                .help("Gap between packet arrivals at one station")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_ARRIVAL_INTERVAL_US),
        )
        .arg(
            Arg::new("data-rate")
                .short('r')
                .long("data-rate")
                .value_name("BITS_PER_SECOND")
                .help("Fixed data rate used by every station")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_DATA_RATE),
        )
        .arg(
            Arg::new("loss-percent")
                .long("loss-percent")
                .value_name("PERCENT")
                .help("Share of receptions lost to noise")
                .value_parser(clap::value_parser!(u32))
                .default_value(DEFAULT_LOSS_PERCENT),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("SEED")
                .help("Override the configured random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value(DEFAULT_LOG_LEVEL),
        )
        .get_matches();

    let log_level = matches.get_one::<String>("log-level").unwrap();
    init_logging(log_level);

    info!("Starting halow-sim v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("Loading configuration from {path}");
            MacConfig::from_file(path)?
        }
        None => MacConfig::default(),
    };
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = *seed;
    }

    let node_count = *matches.get_one::<usize>("nodes").unwrap();
    if node_count < 2 {
        return Err(MacError::Config(
            "At least two stations are required".to_string(),
        ));
    }

    let options = SimOptions {
        config,
        node_count,
        packet_count: *matches.get_one::<u64>("packets").unwrap(),
        payload_bytes: *matches.get_one::<usize>("payload-bytes").unwrap(),
        arrival_interval: *matches.get_one::<u64>("interval-us").unwrap(),
        data_rate_bits_per_second: *matches.get_one::<u64>("data-rate").unwrap(),
        loss_percent: *matches.get_one::<u32>("loss-percent").unwrap(),
    };

    match run_simulation(&options) {
        Ok(()) => Ok(()),
        Err(error) => {
            error!("Simulation failed: {error}");
            process::exit(1);
        }
    }
}

/// Initialize logging at the requested default level, deferring to
/// RUST_LOG when it is set
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Parsed command line options
struct SimOptions {
    config: MacConfig,
    node_count: usize,
    packet_count: u64,
    payload_bytes: usize,
    arrival_interval: SimTime,
    data_rate_bits_per_second: u64,
    loss_percent: u32,
}

/// Build the stations, schedule the offered load, run to completion and
/// report the outcome.
fn run_simulation(options: &SimOptions) -> Result<()> {
    let tx_parameters = TxParameters::new(options.data_rate_bits_per_second, 2);
    let mut simulator = Simulator::new(
        &options.config,
        options.node_count,
        tx_parameters,
        options.loss_percent,
    )?;

    info!(
        "Simulating {} stations, {} packets each, {} byte payloads, {} bps, {}% noise loss",
        options.node_count,
        options.packet_count,
        options.payload_bytes,
        options.data_rate_bits_per_second,
        options.loss_percent
    );

    // One beacon up front so the run opens with a management frame.
    simulator.engines[0].send_beacon_frame("halow-sim", vec![1], ZERO_TIME)?;
    simulator.apply_actions(0);

    let priority_levels = options.config.contention.max_packet_priority as u64 + 1;
    for node in 0..options.node_count {
        let neighbor = (node + 1) % options.node_count;
        let destination = NetworkAddress::new(neighbor as u32 + 1);
        for packet in 0..options.packet_count {
            let filler = (node as u8).wrapping_mul(31).wrapping_add(packet as u8);
            let payload = vec![filler; options.payload_bytes];
            let time = 1_000 + packet * options.arrival_interval + node as SimTime * 13;
            simulator.schedule(
                time,
                SimEvent::EnqueuePacket {
                    node,
                    destination,
                    priority: (packet % priority_levels) as u8,
                    payload,
                },
            );
        }
    }

    simulator.run();
    report(&simulator);
    Ok(())
}

/// Log per-station counters after the run
fn report(simulator: &Simulator) {
    info!(
        "Simulation finished at t={} us with {} collisions",
        simulator.now, simulator.collisions
    );
    for (node, engine) in simulator.engines.iter().enumerate() {
        let stats = engine.stats();
        info!(
            "Node {} ({}): {} data frames sent ({} bytes), {} retries, \
             {} data frames received ({} duplicates), {} payloads delivered, \
             {} dropped at the retry limit, {} undeliverable",
            node,
            engine.mac_address(),
            stats.data_frames_sent,
            stats.data_bytes_sent,
            stats.frame_retries,
            stats.data_frames_received,
            stats.duplicate_frames_received,
            simulator.payloads_delivered[node],
            stats.packets_dropped_retry_limit,
            simulator.payloads_undeliverable[node],
        );
    }
}

/// Occupancy of the medium by one transmission, in sender-side time
#[derive(Debug, Clone, Copy, PartialEq)]
struct AirSpan {
    sender: usize,
    begin: SimTime,
    end: SimTime,
}

impl AirSpan {
    fn overlaps(&self, other: &AirSpan) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// One scheduled notification for a station
#[derive(Debug)]
enum SimEvent {
    EnqueuePacket {
        node: usize,
        destination: NetworkAddress,
        priority: u8,
        payload: Vec<u8>,
    },
    WakeupTimer {
        node: usize,
        generation: u64,
    },
    TransmissionComplete {
        node: usize,
    },
    ChannelBusy {
        node: usize,
    },
    ChannelClear {
        node: usize,
    },
    FrameArrival {
        node: usize,
        span: AirSpan,
        bytes: Vec<u8>,
        tx_parameters: TxParameters,
    },
    SubframeArrival {
        node: usize,
        span: AirSpan,
        bytes: Vec<u8>,
        index: u32,
        count: u32,
        tx_parameters: TxParameters,
    },
}

/// Heap entry ordered by time, then by insertion order for ties
struct Scheduled {
    time: SimTime,
    sequence: u64,
    event: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Closed-loop simulation of stations on one shared medium
struct Simulator {
    engines: Vec<MacEngine>,
    events: BinaryHeap<Scheduled>,
    sequence: u64,
    now: SimTime,
    timer_generations: Vec<u64>,
    busy_depth: Vec<u32>,
    air_spans: Vec<AirSpan>,
    loss_rng: StdRng,
    loss_percent: u32,
    phy_header_duration: SimTime,
    propagation_delay: SimTime,
    payloads_delivered: Vec<u64>,
    payloads_undeliverable: Vec<u64>,
    collisions: u64,
}

impl Simulator {
    fn new(
        base_config: &MacConfig,
        node_count: usize,
        tx_parameters: TxParameters,
        loss_percent: u32,
    ) -> Result<Self> {
        let mut engines = Vec::with_capacity(node_count);
        for index in 0..node_count {
            let mut config = base_config.clone();
            config.node_id = index as u32 + 1;
            let engine = MacEngine::new(
                &config,
                Box::new(FixedRateController::new(tx_parameters)),
                Box::new(FixedPowerController::new(20.0)),
                Box::new(NodeIdResolver::new(config.interface_selector_byte)),
            )?;
            engines.push(engine);
        }

        Ok(Self {
            engines,
            events: BinaryHeap::new(),
            sequence: 0,
            now: ZERO_TIME,
            timer_generations: vec![0; node_count],
            busy_depth: vec![0; node_count],
            air_spans: Vec::new(),
            loss_rng: StdRng::seed_from_u64(base_config.seed),
            loss_percent,
            phy_header_duration: base_config.timing.phy_header_duration_us,
            propagation_delay: base_config.timing.air_propagation_us,
            payloads_delivered: vec![0; node_count],
            payloads_undeliverable: vec![0; node_count],
            collisions: 0,
        })
    }

    fn schedule(&mut self, time: SimTime, event: SimEvent) {
        self.sequence += 1;
        self.events.push(Scheduled {
            time,
            sequence: self.sequence,
            event,
        });
    }

    /// Pop events in time order until none remain
    fn run(&mut self) {
        while let Some(scheduled) = self.events.pop() {
            debug_assert!(scheduled.time >= self.now);
            self.now = scheduled.time;
            if self.now > SIM_HORIZON {
                warn!(
                    "Stopping at the simulation horizon with {} events pending",
                    self.events.len() + 1
                );
                break;
            }
            // A transmission and anything colliding with it resolves well
            // inside a second, so older spans can no longer matter.
            let cutoff = self.now;
            self.air_spans.retain(|span| span.end + SECOND >= cutoff);
            self.handle_event(scheduled.event);
        }
    }

    fn handle_event(&mut self, event: SimEvent) {
        let now = self.now;
        match event {
            SimEvent::EnqueuePacket {
                node,
                destination,
                priority,
                payload,
            } => {
                self.engines[node].enqueue_packet(
                    FrameBuffer::from_payload(&payload),
                    destination,
                    priority,
                    ETHERTYPE_IPV4,
                    now,
                );
                self.apply_actions(node);
            }
            SimEvent::WakeupTimer { node, generation } => {
                if generation != self.timer_generations[node] {
                    return;
                }
                self.engines[node].on_wakeup_timer(now);
                self.apply_actions(node);
            }
            SimEvent::TransmissionComplete { node } => {
                self.engines[node].on_transmission_complete(now);
                self.apply_actions(node);
            }
            SimEvent::ChannelBusy { node } => {
                self.busy_depth[node] += 1;
                if self.busy_depth[node] == 1 {
                    self.engines[node].on_channel_busy(now);
                    self.apply_actions(node);
                }
            }
            SimEvent::ChannelClear { node } => {
                self.busy_depth[node] = self.busy_depth[node].saturating_sub(1);
                if self.busy_depth[node] == 0 {
                    self.engines[node].on_channel_clear(now);
                    self.apply_actions(node);
                }
            }
            SimEvent::FrameArrival {
                node,
                span,
                bytes,
                tx_parameters,
            } => {
                if self.reception_fails(node, &span) {
                    self.engines[node].on_corrupt_frame_received();
                } else {
                    self.engines[node].on_frame_received(&bytes, &tx_parameters, now);
                }
                self.apply_actions(node);
            }
            SimEvent::SubframeArrival {
                node,
                span,
                bytes,
                index,
                count,
                tx_parameters,
            } => {
                if self.reception_fails(node, &span) {
                    self.engines[node].on_corrupt_aggregate_subframe_received(
                        index,
                        count,
                        &tx_parameters,
                    );
                } else {
                    self.engines[node].on_aggregate_subframe_received(
                        &bytes,
                        index,
                        count,
                        &tx_parameters,
                    );
                }
                self.apply_actions(node);
            }
        }
    }

    /// Drain the engine's queued actions and turn them into events
    fn apply_actions(&mut self, node: usize) {
        for action in self.engines[node].drain_actions() {
            match action {
                MacAction::SetWakeupTimer { expires } => {
                    self.timer_generations[node] += 1;
                    let generation = self.timer_generations[node];
                    self.schedule(
                        expires.max(self.now),
                        SimEvent::WakeupTimer { node, generation },
                    );
                }
                MacAction::CancelWakeupTimer => {
                    self.timer_generations[node] += 1;
                }
                MacAction::TransmitFrame {
                    frame,
                    tx_parameters,
                    power_dbm: _,
                    delay,
                } => {
                    self.transmit(node, vec![frame], tx_parameters, delay, false);
                }
                MacAction::TransmitAggregateFrame {
                    subframes,
                    tx_parameters,
                    power_dbm: _,
                    delay,
                } => {
                    self.transmit(node, subframes, tx_parameters, delay, true);
                }
                MacAction::DeliverPacket {
                    payload,
                    source,
                    ether_type: _,
                } => {
                    trace!(
                        "Node {node} delivered {} payload bytes from {source}",
                        payload.len()
                    );
                    self.payloads_delivered[node] += 1;
                }
                MacAction::PacketUndeliverable {
                    payload,
                    next_hop_address,
                } => {
                    debug!(
                        "Node {node} gave up on {} bytes for {next_hop_address}",
                        payload.len()
                    );
                    self.payloads_undeliverable[node] += 1;
                }
                MacAction::SwitchToChannels { channels } => {
                    debug!("Node {node} retunes to channels {channels:?}");
                }
                MacAction::StartReceiving | MacAction::StopReceiving => {}
                MacAction::ManagementFrameReceived { frame } => {
                    debug!("Node {node} received a {} byte management frame", frame.len());
                }
                MacAction::BeaconTransmitted => {
                    debug!("Node {node} finished sending its beacon");
                }
                MacAction::PsPollReceived {
                    from,
                    association_id,
                } => {
                    debug!("Node {node} was polled by {from} (association id {association_id})");
                }
                MacAction::PowerManagementChanged { from, sleeping } => {
                    debug!(
                        "Node {node} saw {from} {}",
                        if sleeping { "enter power save" } else { "wake up" }
                    );
                }
            }
        }
    }

    /// Put one transmission on the medium and schedule what every other
    /// station hears.
    fn transmit(
        &mut self,
        sender: usize,
        subframes: Vec<FrameBuffer>,
        tx_parameters: TxParameters,
        delay: SimTime,
        is_aggregate: bool,
    ) {
        let total_bytes: usize = subframes.iter().map(|frame| frame.len()).sum();
        let begin = self.now + delay;
        let end = begin + self.phy_header_duration + tx_parameters.frame_duration(total_bytes);
        let span = AirSpan { sender, begin, end };
        self.air_spans.push(span);

        self.schedule(end, SimEvent::TransmissionComplete { node: sender });

        for node in 0..self.engines.len() {
            if node == sender {
                continue;
            }
            self.schedule(
                begin + self.propagation_delay,
                SimEvent::ChannelBusy { node },
            );
            let arrival = end + self.propagation_delay;
            if is_aggregate {
                let count = subframes.len() as u32;
                for (index, frame) in subframes.iter().enumerate() {
                    self.schedule(
                        arrival,
                        SimEvent::SubframeArrival {
                            node,
                            span,
                            bytes: frame.to_vec(),
                            index: index as u32,
                            count,
                            tx_parameters,
                        },
                    );
                }
            } else {
                for frame in &subframes {
                    self.schedule(
                        arrival,
                        SimEvent::FrameArrival {
                            node,
                            span,
                            bytes: frame.to_vec(),
                            tx_parameters,
                        },
                    );
                }
            }
            self.schedule(arrival, SimEvent::ChannelClear { node });
        }
    }

    /// True when this reception is destroyed by a colliding transmission,
    /// by the station's own transmitter being keyed, or by noise.
    fn reception_fails(&mut self, node: usize, span: &AirSpan) -> bool {
        let collided = self
            .air_spans
            .iter()
            .any(|other| other.sender != span.sender && other.overlaps(span));
        if collided {
            self.collisions += 1;
            debug!("Node {node} reception collided");
            return true;
        }
        if self.loss_percent > 0 && self.loss_rng.gen_range(0..100) < self.loss_percent {
            trace!("Node {node} reception lost to noise");
            return true;
        }
        false
    }
}
