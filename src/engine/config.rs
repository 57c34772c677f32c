//! Engine configuration
//!
//! This module holds the MAC parameter set, its standard defaults, file
//! loading and validation. Timing values the original hardware would learn
//! from the radio are plain config here so scenarios stay reproducible.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::access::{
    self, AccessCategory, MAX_PACKET_PRIORITY, NUMBER_EDCA_CATEGORIES,
};
use crate::time::{SimTime, MICRO_SECOND};
use crate::{MacError, Result};

/// Upper bound on any per-category transmit opportunity
pub const MAX_TRANSMIT_OPPORTUNITY_DURATION: SimTime = 8160 * MICRO_SECOND;

/// Channel access arbitration flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosType {
    /// Four EDCA categories with per-class parameters
    Edca,
    /// Single legacy DCF category
    Dcf,
}

/// Top-level MAC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Simulator node id this interface belongs to
    pub node_id: u32,
    /// Interface selector byte mixed into the MAC address
    pub interface_selector_byte: u8,
    /// Seed for the engine's backoff RNG
    pub seed: u64,
    /// Channel access flavor
    pub qos_type: QosType,
    /// Zero-length NDP control responses instead of full ACK/CTS frames
    pub use_ndp_control_frames: bool,
    /// Contention parameters
    pub contention: ContentionConfig,
    /// Interframe and PHY timing
    pub timing: TimingConfig,
    /// MPDU aggregation parameters
    pub aggregation: AggregationConfig,
    /// Network output queue limits
    pub queue: QueueConfig,
}

/// Contention window, retry and priority mapping parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionConfig {
    /// Base minimum contention window in slots
    pub contention_window_min_slots: u32,
    /// Maximum contention window in slots
    pub contention_window_max_slots: u32,
    /// Highest packet priority the queue accepts
    pub max_packet_priority: u8,
    /// Attempt limit for short frames, RTS and Block-Ack-Requests
    pub short_frame_retry_limit: u32,
    /// Attempt limit for frames sent above the RTS threshold
    pub long_frame_retry_limit: u32,
    /// Frame sizes at or above this are protected by RTS/CTS
    pub rts_threshold_size_bytes: u32,
    /// Never seize an idle medium without a backoff draw
    pub disable_jump_on_medium_without_backoff: bool,
    /// Per-category transmit opportunity durations in microseconds;
    /// empty means no TXOPs
    pub transmit_opportunity_durations_us: Vec<u64>,
    /// Queue lifetime after which packets expire; unset means unlimited
    pub frame_lifetime_us: Option<u64>,
    /// Explicit per-category priority lists overriding the even distribution
    pub priority_lists: Option<Vec<Vec<u8>>>,
}

/// Interframe spacings and PHY delays, all in microseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sifs_us: u64,
    pub slot_us: u64,
    pub rx_tx_turnaround_us: u64,
    pub phy_rx_start_delay_us: u64,
    pub phy_header_duration_us: u64,
    pub air_propagation_us: u64,
    /// Gap before a follow-on transmission when the radio is already keyed
    pub delay_between_consecutive_frames_us: u64,
}

/// MPDU aggregation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Byte budget for one aggregate; zero disables aggregation
    pub max_aggregate_size_bytes: usize,
    /// Send a lone acked frame before each fresh aggregate
    pub protect_aggregates_with_single_acked_frame: bool,
    /// Build aggregates even when the category has no TXOP
    pub allow_aggregation_with_txop_zero: bool,
}

/// Network output queue limits; zero means unlimited
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Cap on buffered packets per priority subqueue
    pub max_packets_per_priority: usize,
    /// Cap on buffered payload bytes per priority subqueue
    pub max_bytes_per_priority: u64,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            interface_selector_byte: 0,
            seed: 1,
            qos_type: QosType::Edca,
            use_ndp_control_frames: false,
            contention: ContentionConfig::default(),
            timing: TimingConfig::default(),
            aggregation: AggregationConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_packets_per_priority: 0,
            max_bytes_per_priority: 0,
        }
    }
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            contention_window_min_slots: 15,
            contention_window_max_slots: 1023,
            max_packet_priority: 3,
            short_frame_retry_limit: 7,
            long_frame_retry_limit: 4,
            rts_threshold_size_bytes: u32::MAX,
            disable_jump_on_medium_without_backoff: false,
            transmit_opportunity_durations_us: Vec::new(),
            frame_lifetime_us: None,
            priority_lists: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        // Sub-gigahertz (S1G) timing at 2 MHz bandwidth.
        Self {
            sifs_us: 160,
            slot_us: 52,
            rx_tx_turnaround_us: 5,
            phy_rx_start_delay_us: 240,
            phy_header_duration_us: 240,
            air_propagation_us: 1,
            delay_between_consecutive_frames_us: 0,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_aggregate_size_bytes: 65535,
            protect_aggregates_with_single_acked_frame: true,
            allow_aggregation_with_txop_zero: false,
        }
    }
}

/// Outcome of a configuration check
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl MacConfig {
    /// Load a configuration from a JSON or TOML file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|error| MacError::Config(format!("Invalid JSON config: {}", error))),
            Some("toml") => toml::from_str(&content)
                .map_err(|error| MacError::Config(format!("Invalid TOML config: {}", error))),
            other => Err(MacError::Config(format!(
                "Unsupported config extension: {:?}",
                other
            ))),
        }
    }

    /// Number of access categories this configuration produces
    pub fn number_access_categories(&self) -> usize {
        match self.qos_type {
            QosType::Edca => NUMBER_EDCA_CATEGORIES,
            QosType::Dcf => 1,
        }
    }

    /// Build the access category set described by this configuration.
    /// Call [`MacConfig::validate`] first; this assumes a valid config.
    pub fn build_access_categories(&self) -> Vec<AccessCategory> {
        let contention = &self.contention;

        let mut categories = match self.qos_type {
            QosType::Edca => access::edca_categories(
                contention.contention_window_min_slots,
                contention.contention_window_max_slots,
                contention.max_packet_priority,
            ),
            QosType::Dcf => access::dcf_categories(
                contention.contention_window_min_slots,
                contention.contention_window_max_slots,
            ),
        };

        if let Some(lists) = &contention.priority_lists {
            for (category, list) in categories.iter_mut().zip(lists) {
                category.priorities = list.clone();
            }
        }

        for (category, duration) in categories
            .iter_mut()
            .zip(&contention.transmit_opportunity_durations_us)
        {
            category.transmit_opportunity_duration = *duration;
        }

        if let Some(lifetime) = contention.frame_lifetime_us {
            for category in &mut categories {
                category.frame_lifetime = lifetime;
            }
        }

        categories
    }

    /// Check the configuration for fatal errors and suspicious values
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let contention = &self.contention;

        if contention.contention_window_max_slots < contention.contention_window_min_slots {
            result.errors.push(format!(
                "contention_window_max_slots {} is below contention_window_min_slots {}",
                contention.contention_window_max_slots, contention.contention_window_min_slots
            ));
        }

        if self.qos_type == QosType::Edca && contention.contention_window_min_slots < 3 {
            result.errors.push(format!(
                "contention_window_min_slots {} is too small to derive the EDCA category windows",
                contention.contention_window_min_slots
            ));
        }

        if self.qos_type == QosType::Dcf && contention.contention_window_min_slots == 0 {
            result
                .errors
                .push("contention_window_min_slots cannot be 0".to_string());
        }

        if contention.max_packet_priority > MAX_PACKET_PRIORITY {
            result.errors.push(format!(
                "max_packet_priority {} exceeds {}",
                contention.max_packet_priority, MAX_PACKET_PRIORITY
            ));
        }

        if contention.short_frame_retry_limit < 1 {
            result
                .errors
                .push("short_frame_retry_limit must be at least 1".to_string());
        }

        if contention.long_frame_retry_limit < 1 {
            result
                .errors
                .push("long_frame_retry_limit must be at least 1".to_string());
        }

        let number_categories = self.number_access_categories();

        if !contention.transmit_opportunity_durations_us.is_empty()
            && contention.transmit_opportunity_durations_us.len() != number_categories
        {
            result.errors.push(format!(
                "transmit_opportunity_durations_us lists {} categories, expected {}",
                contention.transmit_opportunity_durations_us.len(),
                number_categories
            ));
        }

        for (index, duration) in contention
            .transmit_opportunity_durations_us
            .iter()
            .enumerate()
        {
            if *duration > MAX_TRANSMIT_OPPORTUNITY_DURATION {
                result.errors.push(format!(
                    "transmit opportunity for category {} is {} us, maximum is {} us",
                    index, duration, MAX_TRANSMIT_OPPORTUNITY_DURATION
                ));
            }
        }

        if let Some(lists) = &contention.priority_lists {
            if lists.len() != number_categories {
                result.errors.push(format!(
                    "priority_lists has {} entries, expected {}",
                    lists.len(),
                    number_categories
                ));
            } else {
                let categories = self.build_access_categories();
                if let Err(error) =
                    access::validate_priority_mapping(&categories, contention.max_packet_priority)
                {
                    result.errors.push(error.to_string());
                }
            }
        }

        if self.timing.slot_us == 0 {
            result.errors.push("slot_us cannot be 0".to_string());
        }
        if self.timing.sifs_us == 0 {
            result.errors.push("sifs_us cannot be 0".to_string());
        }
        if self.timing.rx_tx_turnaround_us > self.timing.sifs_us {
            result.warnings.push(format!(
                "rx_tx_turnaround_us {} exceeds sifs_us {}; interframe spacing will clamp",
                self.timing.rx_tx_turnaround_us, self.timing.sifs_us
            ));
        }

        if self.aggregation.max_aggregate_size_bytes != 0
            && self.aggregation.max_aggregate_size_bytes < 100
        {
            result.warnings.push(format!(
                "max_aggregate_size_bytes {} leaves no room for headers and delimiters",
                self.aggregation.max_aggregate_size_bytes
            ));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MacConfig::default();
        let result = config.validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(config.contention.contention_window_min_slots, 15);
        assert_eq!(config.contention.contention_window_max_slots, 1023);
        assert_eq!(config.contention.short_frame_retry_limit, 7);
        assert_eq!(config.contention.long_frame_retry_limit, 4);
        assert_eq!(config.contention.rts_threshold_size_bytes, u32::MAX);
    }

    #[test]
    fn test_default_builds_four_edca_categories() {
        let config = MacConfig::default();
        let categories = config.build_access_categories();
        assert_eq!(categories.len(), 4);
        // Default max priority 3 spreads one priority per category.
        assert_eq!(categories[0].priorities, vec![0]);
        assert_eq!(categories[3].priorities, vec![3]);
    }

    #[test]
    fn test_dcf_builds_single_category() {
        let config = MacConfig {
            qos_type: QosType::Dcf,
            ..MacConfig::default()
        };
        assert_eq!(config.number_access_categories(), 1);
        let categories = config.build_access_categories();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].arbitration_interframe_space_slots, 2);
    }

    #[test]
    fn test_validation_rejects_inverted_windows() {
        let mut config = MacConfig::default();
        config.contention.contention_window_min_slots = 1023;
        config.contention.contention_window_max_slots = 15;
        let result = config.validate();
        assert!(!result.is_valid());
    }

    #[test]
    fn test_validation_rejects_oversized_txop() {
        let mut config = MacConfig::default();
        config.contention.transmit_opportunity_durations_us = vec![0, 0, 0, 10_000];
        let result = config.validate();
        assert!(!result.is_valid());

        config.contention.transmit_opportunity_durations_us = vec![0, 0, 0, 8160];
        let result = config.validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_validation_rejects_bad_priority_lists() {
        let mut config = MacConfig::default();
        // Priority 2 appears twice, priority 3 never.
        config.contention.priority_lists = Some(vec![vec![0], vec![1], vec![2], vec![2]]);
        let result = config.validate();
        assert!(!result.is_valid());

        config.contention.priority_lists = Some(vec![vec![0], vec![1], vec![2], vec![3]]);
        let result = config.validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_txop_durations_applied_to_categories() {
        let mut config = MacConfig::default();
        config.contention.transmit_opportunity_durations_us = vec![0, 0, 3008, 1504];
        let categories = config.build_access_categories();
        assert_eq!(categories[2].transmit_opportunity_duration, 3008);
        assert_eq!(categories[3].transmit_opportunity_duration, 1504);
    }

    #[test]
    fn test_json_round_trip() {
        let config = MacConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: MacConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(
            back.contention.contention_window_max_slots,
            config.contention.contention_window_max_slots
        );
        assert_eq!(back.qos_type, QosType::Edca);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = "node_id = 9\n\n[contention]\ncontention_window_min_slots = 31\n";
        let config: MacConfig = toml::from_str(text).unwrap();
        assert_eq!(config.node_id, 9);
        assert_eq!(config.contention.contention_window_min_slots, 31);
        // Untouched fields keep their defaults.
        assert_eq!(config.contention.contention_window_max_slots, 1023);
        assert_eq!(config.timing.sifs_us, 160);
    }
}
