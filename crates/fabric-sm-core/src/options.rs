//! Resolved subnet manager options.
//!
//! The core reads these once per sweep and never mutates them. Field names
//! and defaults follow the classic subnet manager configuration so an
//! operator's existing settings carry over.

use crate::error::{SmError, SmResult};
use crate::state_machine::TieBreak;
use fabric_sm_types::Guid;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest LMC the LID space can express.
pub const MAX_LMC: u8 = 7;

/// Priorities are carried in a 4-bit field.
pub const MAX_SM_PRIORITY: u8 = 15;

/// Port classes with distinct QoS parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortClass {
    ChannelAdapter,
    /// Switch management port 0.
    SwitchPort0,
    /// Switch external ports.
    SwitchExternal,
    Router,
}

/// QoS parameters for one port class. The tables are kept in their textual
/// form and handed to the collaborator that programs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosOptions {
    #[serde(default = "default_max_vls")]
    pub max_vls: u8,

    #[serde(default)]
    pub high_limit: u8,

    #[serde(default = "default_vlarb_high")]
    pub vlarb_high: String,

    #[serde(default = "default_vlarb_low")]
    pub vlarb_low: String,

    #[serde(default = "default_sl2vl")]
    pub sl2vl: String,
}

/// QoS settings: a default set plus optional per-class overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub default: QosOptions,

    #[serde(default)]
    pub ca: Option<QosOptions>,

    #[serde(default)]
    pub sw0: Option<QosOptions>,

    #[serde(default)]
    pub swe: Option<QosOptions>,

    #[serde(default)]
    pub rtr: Option<QosOptions>,
}

/// Options consumed by the subnet context and the sweep controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetOptions {
    /// Port GUID the manager binds to. Zero selects the first local port.
    #[serde(default = "default_guid")]
    pub guid: Guid,

    #[serde(default)]
    pub m_key: u64,

    /// Trusted SM key shared by cooperating managers.
    #[serde(default)]
    pub sm_key: u64,

    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: u64,

    /// Seconds between periodic sweeps; 0 disables periodic sweeping.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_ms: u64,

    /// Retries per probe before the target is marked unresolved.
    #[serde(default = "default_transaction_retries")]
    pub transaction_retries: u32,

    /// Probes allowed in flight at once.
    #[serde(default = "default_max_wire_smps")]
    pub max_wire_smps: u32,

    #[serde(default = "default_sm_priority")]
    pub sm_priority: u8,

    #[serde(default)]
    pub tie_break: TieBreak,

    #[serde(default)]
    pub lmc: u8,

    /// Apply the LMC to switch port 0 as well.
    #[serde(default)]
    pub lmc_esp0: bool,

    #[serde(default)]
    pub reassign_lids: bool,

    #[serde(default)]
    pub ignore_other_sm: bool,

    #[serde(default)]
    pub disable_multicast: bool,

    #[serde(default = "default_sminfo_polling_timeout")]
    pub sminfo_polling_timeout_ms: u64,

    #[serde(default = "default_polling_retry_number")]
    pub polling_retry_number: u32,

    /// Make every sweep a heavy sweep.
    #[serde(default)]
    pub force_heavy_sweep: bool,

    #[serde(default = "default_true")]
    pub sweep_on_trap: bool,

    #[serde(default = "default_routing_engine")]
    pub routing_engine: String,

    #[serde(default = "default_true")]
    pub exit_on_fatal: bool,

    #[serde(default)]
    pub honor_guid2lid_file: bool,

    /// Keep the manager NotActive.
    #[serde(default)]
    pub sm_inactive: bool,

    #[serde(default)]
    pub qos: QosSettings,
}

fn default_guid() -> Guid {
    Guid::ZERO
}

fn default_subnet_prefix() -> u64 {
    0xfe80_0000_0000_0000
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_transaction_timeout() -> u64 {
    200
}

fn default_transaction_retries() -> u32 {
    3
}

fn default_max_wire_smps() -> u32 {
    4
}

fn default_sm_priority() -> u8 {
    1
}

fn default_sminfo_polling_timeout() -> u64 {
    10_000
}

fn default_polling_retry_number() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_routing_engine() -> String {
    "minhop".to_string()
}

fn default_max_vls() -> u8 {
    15
}

fn default_vlarb_high() -> String {
    "0:4,1:0,2:0,3:0,4:0,5:0,6:0,7:0,8:0,9:0,10:0,11:0,12:0,13:0,14:0".to_string()
}

fn default_vlarb_low() -> String {
    "0:0,1:4,2:4,3:4,4:4,5:4,6:4,7:4,8:4,9:4,10:4,11:4,12:4,13:4,14:4".to_string()
}

fn default_sl2vl() -> String {
    "0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,7".to_string()
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            max_vls: default_max_vls(),
            high_limit: 0,
            vlarb_high: default_vlarb_high(),
            vlarb_low: default_vlarb_low(),
            sl2vl: default_sl2vl(),
        }
    }
}

impl Default for SubnetOptions {
    fn default() -> Self {
        Self {
            guid: default_guid(),
            m_key: 0,
            sm_key: 0,
            subnet_prefix: default_subnet_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            transaction_timeout_ms: default_transaction_timeout(),
            transaction_retries: default_transaction_retries(),
            max_wire_smps: default_max_wire_smps(),
            sm_priority: default_sm_priority(),
            tie_break: TieBreak::default(),
            lmc: 0,
            lmc_esp0: false,
            reassign_lids: false,
            ignore_other_sm: false,
            disable_multicast: false,
            sminfo_polling_timeout_ms: default_sminfo_polling_timeout(),
            polling_retry_number: default_polling_retry_number(),
            force_heavy_sweep: false,
            sweep_on_trap: true,
            routing_engine: default_routing_engine(),
            exit_on_fatal: true,
            honor_guid2lid_file: false,
            sm_inactive: false,
            qos: QosSettings::default(),
        }
    }
}

impl QosSettings {
    /// Parameters for a port class, falling back to the default set.
    pub fn for_class(&self, class: PortClass) -> &QosOptions {
        let specific = match class {
            PortClass::ChannelAdapter => self.ca.as_ref(),
            PortClass::SwitchPort0 => self.sw0.as_ref(),
            PortClass::SwitchExternal => self.swe.as_ref(),
            PortClass::Router => self.rtr.as_ref(),
        };
        specific.unwrap_or(&self.default)
    }
}

impl SubnetOptions {
    /// Periodic sweep interval, or `None` when periodic sweeping is off.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Attempts per probe target: the first try plus the retries.
    pub fn probe_attempts(&self) -> u32 {
        self.transaction_retries.saturating_add(1)
    }

    pub fn sminfo_polling_timeout(&self) -> Duration {
        Duration::from_millis(self.sminfo_polling_timeout_ms)
    }

    /// Silence after which a peer manager is presumed dead.
    pub fn peer_timeout(&self) -> Duration {
        self.sminfo_polling_timeout() * self.polling_retry_number
    }

    /// Checks option ranges.
    pub fn validate(&self) -> SmResult<()> {
        if self.sm_priority > MAX_SM_PRIORITY {
            return Err(SmError::invalid_options(
                "sm_priority",
                format!("must be 0-{}", MAX_SM_PRIORITY),
            ));
        }
        if self.lmc > MAX_LMC {
            return Err(SmError::invalid_options(
                "lmc",
                format!("must be 0-{}", MAX_LMC),
            ));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(SmError::invalid_options(
                "transaction_timeout_ms",
                "must be > 0",
            ));
        }
        if self.max_wire_smps == 0 {
            return Err(SmError::invalid_options("max_wire_smps", "must be > 0"));
        }
        if self.polling_retry_number == 0 {
            return Err(SmError::invalid_options(
                "polling_retry_number",
                "must be > 0",
            ));
        }
        if self.routing_engine.trim().is_empty() {
            return Err(SmError::invalid_options(
                "routing_engine",
                "must not be empty",
            ));
        }
        for (name, qos) in [
            ("qos.default", Some(&self.qos.default)),
            ("qos.ca", self.qos.ca.as_ref()),
            ("qos.sw0", self.qos.sw0.as_ref()),
            ("qos.swe", self.qos.swe.as_ref()),
            ("qos.rtr", self.qos.rtr.as_ref()),
        ] {
            if let Some(qos) = qos {
                if qos.max_vls == 0 || qos.max_vls > 15 {
                    return Err(SmError::invalid_options(name, "max_vls must be 1-15"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SubnetOptions::default();
        assert_eq!(opts.sweep_interval(), Some(Duration::from_secs(10)));
        assert_eq!(opts.transaction_timeout(), Duration::from_millis(200));
        assert_eq!(opts.max_wire_smps, 4);
        assert_eq!(opts.sm_priority, 1);
        assert_eq!(opts.lmc, 0);
        assert_eq!(opts.routing_engine, "minhop");
        assert!(!opts.disable_multicast);
        assert!(opts.sweep_on_trap);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_peer_timeout() {
        let opts = SubnetOptions::default();
        assert_eq!(opts.peer_timeout(), Duration::from_secs(40));
        assert_eq!(opts.probe_attempts(), 4);
    }

    #[test]
    fn test_zero_interval_disables_periodic_sweep() {
        let opts = SubnetOptions {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(opts.sweep_interval(), None);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut opts = SubnetOptions::default();
        opts.lmc = 8;
        assert!(matches!(
            opts.validate(),
            Err(SmError::InvalidOptions { ref field, .. }) if field == "lmc"
        ));

        let mut opts = SubnetOptions::default();
        opts.sm_priority = 16;
        assert!(opts.validate().is_err());

        let mut opts = SubnetOptions::default();
        opts.qos.swe = Some(QosOptions {
            max_vls: 0,
            ..Default::default()
        });
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_qos_class_fallback() {
        let mut qos = QosSettings::default();
        qos.sw0 = Some(QosOptions {
            max_vls: 1,
            ..Default::default()
        });
        assert_eq!(qos.for_class(PortClass::SwitchPort0).max_vls, 1);
        assert_eq!(qos.for_class(PortClass::ChannelAdapter).max_vls, 15);
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let opts: SubnetOptions =
            serde_json::from_str(r#"{"sm_priority": 7, "guid": "0x0002c90300000001"}"#).unwrap();
        assert_eq!(opts.sm_priority, 7);
        assert_eq!(opts.guid, Guid::new(0x0002_c903_0000_0001));
        assert_eq!(opts.sweep_interval_secs, 10);
    }
}
