// SPDX-License-Identifier: AGPL-3.0-only

//! Boot-time transport configuration
//!
//! Both sides of a link must be probed with the same transport and doorbell
//! method. The RC records its choice in the MCB; the EP refuses to attach
//! when its own configuration disagrees.

use crate::error::{EpfError, Result};
use epf_proto::limits::{DEFAULT_DMA_BURST, DMA_ALIGN};
use epf_proto::TransportKind;
use std::time::Duration;

/// How the RC signals the EP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DoorbellMethod {
    /// Write `db_data` into the EP doorbell mailbox
    #[default]
    Msi,
    /// Toggle a platform GPIO line wired to the EP
    Gpio,
}

impl DoorbellMethod {
    /// Lower-case name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Msi => "msi",
            Self::Gpio => "gpio",
        }
    }
}

impl std::fmt::Display for DoorbellMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DoorbellMethod {
    type Err = EpfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "msi" => Ok(Self::Msi),
            "gpio" => Ok(Self::Gpio),
            other => Err(EpfError::invalid_argument(format!(
                "unknown doorbell method '{other}'"
            ))),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// MCB layout flavour
    pub transport: TransportKind,

    /// RC → EP doorbell
    pub doorbell: DoorbellMethod,

    /// Active subdevices
    pub nr_subdevices: usize,

    /// Bytes of RC memory reserved per subdevice (`subdevice_rmem[i].size`)
    pub region_size: usize,

    /// RC DMA pool size; must hold every subdevice region plus local buffers
    pub rc_pool_size: usize,

    /// EP memory BAR size; the EP pool covers it
    pub ep_mem_size: usize,

    /// Default deadline for waits on the peer
    pub wait_timeout: Duration,

    /// Longest a DMA completion may take before the endpoint is declared dead
    pub dma_watchdog: Duration,

    /// DMA channels per side
    pub dma_channels: usize,

    /// Engine burst; lengths are split into a burst-aligned head and a tail
    pub dma_burst: usize,

    /// Address alignment the DMA engines require
    pub dma_align: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            doorbell: DoorbellMethod::default(),
            nr_subdevices: 1,
            region_size: 1 << 20,
            rc_pool_size: 32 << 20,
            ep_mem_size: 16 << 20,
            wait_timeout: Duration::from_secs(5),
            dma_watchdog: Duration::from_secs(10),
            dma_channels: 2,
            dma_burst: DEFAULT_DMA_BURST,
            dma_align: DMA_ALIGN,
        }
    }
}

impl TransportConfig {
    /// Defaults overlaid with `EPF_*` environment variables
    ///
    /// Reads `EPF_TRANSPORT`, `EPF_DOORBELL_METHOD`, `EPF_NR_SUBDEVICES`
    /// and `EPF_WAIT_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    ///
    /// # Errors
    ///
    /// Same as [`TransportConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("EPF_TRANSPORT") {
            config.transport = v.parse().map_err(EpfError::invalid_argument)?;
        }
        if let Some(v) = lookup("EPF_DOORBELL_METHOD") {
            config.doorbell = v.parse()?;
        }
        if let Some(v) = lookup("EPF_NR_SUBDEVICES") {
            config.nr_subdevices = v.trim().parse().map_err(|e| {
                EpfError::invalid_argument(format!("EPF_NR_SUBDEVICES='{v}': {e}"))
            })?;
        }
        if let Some(v) = lookup("EPF_WAIT_TIMEOUT_MS") {
            let ms: u64 = v.trim().parse().map_err(|e| {
                EpfError::invalid_argument(format!("EPF_WAIT_TIMEOUT_MS='{v}': {e}"))
            })?;
            config.wait_timeout = Duration::from_millis(ms);
        }

        tracing::debug!(
            "Transport config: {} doorbell={} nr_subdevices={}",
            config.transport,
            config.doorbell,
            config.nr_subdevices
        );
        Ok(config)
    }

    /// Builder-style transport selection
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Builder-style doorbell selection
    #[must_use]
    pub const fn with_doorbell(mut self, doorbell: DoorbellMethod) -> Self {
        self.doorbell = doorbell;
        self
    }

    /// Builder-style subdevice count
    #[must_use]
    pub const fn with_subdevices(mut self, nr: usize) -> Self {
        self.nr_subdevices = nr;
        self
    }

    /// Check the configuration can be probed
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let max = self.transport.layout().max_subdevices();
        if self.nr_subdevices == 0 || self.nr_subdevices > max {
            return Err(EpfError::invalid_argument(format!(
                "nr_subdevices {} outside 1..={max} for {}",
                self.nr_subdevices, self.transport
            )));
        }
        if self.region_size == 0 || self.region_size as u64 % DMA_ALIGN != 0 {
            return Err(EpfError::invalid_argument(format!(
                "region_size {:#x} must be a non-zero multiple of {DMA_ALIGN}",
                self.region_size
            )));
        }
        if u32::try_from(self.region_size).is_err() {
            return Err(EpfError::invalid_argument(format!(
                "region_size {:#x} does not fit the 32-bit size word",
                self.region_size
            )));
        }
        let carved = self.region_size.saturating_mul(self.nr_subdevices);
        if self.rc_pool_size < carved {
            return Err(EpfError::invalid_argument(format!(
                "rc_pool_size {:#x} smaller than {} regions of {:#x}",
                self.rc_pool_size, self.nr_subdevices, self.region_size
            )));
        }
        if self.ep_mem_size == 0 || u32::try_from(self.ep_mem_size).is_err() {
            return Err(EpfError::invalid_argument(format!(
                "ep_mem_size {:#x} must be non-zero and 32-bit addressable",
                self.ep_mem_size
            )));
        }
        if self.dma_channels == 0 {
            return Err(EpfError::invalid_argument("dma_channels must be non-zero"));
        }
        if !self.dma_burst.is_power_of_two() || (self.dma_burst as u64) < DMA_ALIGN {
            return Err(EpfError::invalid_argument(format!(
                "dma_burst {} must be a power of two >= {DMA_ALIGN}",
                self.dma_burst
            )));
        }
        if !self.dma_align.is_power_of_two() || self.dma_align < DMA_ALIGN {
            return Err(EpfError::invalid_argument(format!(
                "dma_align {} must be a power of two >= {DMA_ALIGN}",
                self.dma_align
            )));
        }
        if self.wait_timeout.is_zero() || self.dma_watchdog.is_zero() {
            return Err(EpfError::invalid_argument("timeouts must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let c = TransportConfig::default();
        assert_eq!(c.doorbell, DoorbellMethod::Msi);
        assert_eq!(c.transport, TransportKind::Excalibur);
        c.validate().unwrap();
    }

    #[test]
    fn env_overlay() {
        let c = TransportConfig::from_lookup(lookup(&[
            ("EPF_TRANSPORT", "moemoekyun"),
            ("EPF_DOORBELL_METHOD", "GPIO"),
            ("EPF_NR_SUBDEVICES", "8"),
            ("EPF_WAIT_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(c.transport, TransportKind::Moemoekyun);
        assert_eq!(c.doorbell, DoorbellMethod::Gpio);
        assert_eq!(c.nr_subdevices, 8);
        assert_eq!(c.wait_timeout, Duration::from_millis(250));
        c.validate().unwrap();
    }

    #[test]
    fn bad_env_values_are_rejected() {
        for vars in [
            [("EPF_TRANSPORT", "pcie")],
            [("EPF_DOORBELL_METHOD", "irq")],
            [("EPF_NR_SUBDEVICES", "many")],
            [("EPF_WAIT_TIMEOUT_MS", "-1")],
        ] {
            let err = TransportConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, EpfError::InvalidArgument { .. }), "{vars:?}");
        }
    }

    #[test]
    fn bsb_is_limited_to_one_subdevice() {
        let c = TransportConfig::default()
            .with_transport(TransportKind::Bsb)
            .with_subdevices(2);
        assert!(c.validate().is_err());
        assert!(c.with_subdevices(1).validate().is_ok());
    }

    #[test]
    fn pool_must_hold_every_region() {
        let mut c = TransportConfig::default().with_subdevices(16);
        c.rc_pool_size = 8 << 20;
        assert!(c.validate().is_err());
    }

    #[test]
    fn dma_align_must_be_a_power_of_two() {
        let mut c = TransportConfig::default();
        c.dma_align = 48;
        assert!(c.validate().is_err());
        c.dma_align = 4;
        assert!(c.validate().is_err());
        c.dma_align = 64;
        c.validate().unwrap();
    }

    #[test]
    fn zero_subdevices_rejected() {
        assert!(TransportConfig::default().with_subdevices(0).validate().is_err());
    }
}
