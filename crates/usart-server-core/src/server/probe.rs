//! Capability detection
//!
//! Finds out what the attached driver really accepts by trying
//! configurations and watching which ones are rejected. Receive and transmit
//! are disabled while probing and the command-exchange configuration is
//! restored afterwards.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::{
    AuxLines, CommConfig, DataBits, FlowControl, LineOption, Mode, Parity, StopBits, UsartDriver,
};

use super::transport::Transport;

/// Canonical baud rates, ascending
pub const BAUD_RATES: [u32; 8] = [
    9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 921_600,
];

/// Rates tried when searching for a ceiling above the canonical table:
/// powers of ten from 10^8 down to 10^4 with their halves and fifths.
pub fn decade_rates() -> impl Iterator<Item = u32> {
    [100_000_000u32, 10_000_000, 1_000_000, 100_000]
        .into_iter()
        .flat_map(|decade| [decade, decade / 2, decade / 5])
        .chain(std::iter::once(10_000))
}

/// What the transport supports, as reported by `GET CAP`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    /// Bit 0..5: async, sync master, sync slave, single-wire, IrDA, smart card
    pub mode_mask: u32,
    /// Bit 0..4: 5..9 data bits
    pub data_bits_mask: u32,
    /// Bit 0..2: none, even, odd
    pub parity_mask: u32,
    /// Bit 0..3: 1, 2, 1.5, 0.5 stop bits
    pub stop_bits_mask: u32,
    /// Bit 0..3: none, CTS, RTS, RTS+CTS
    pub flow_control_mask: u32,
    /// Bit 0..5: RTS, CTS, DTR, DSR, DCD, RI
    pub modem_lines_mask: u32,
    /// Lowest accepted canonical rate
    pub min_baud: u32,
    /// Highest accepted rate
    pub max_baud: u32,
}

impl CapabilitySnapshot {
    /// Text record sent in reply to `GET CAP`
    pub fn to_record(&self) -> String {
        format!(
            "{:02X},{:02X},{:X},{:X},{:X},{:X},{},{}",
            self.mode_mask,
            self.data_bits_mask,
            self.parity_mask,
            self.stop_bits_mask,
            self.flow_control_mask,
            self.modem_lines_mask,
            self.min_baud,
            self.max_baud
        )
    }
}

fn accepts(driver: &mut dyn UsartDriver, config: &CommConfig) -> bool {
    driver.configure(config).is_ok()
}

/// Mask of the `T` options the driver accepts when applied to `base`
fn option_mask<T, F>(driver: &mut dyn UsartDriver, base: &CommConfig, with: F) -> u32
where
    T: LineOption,
    F: Fn(CommConfig, T) -> CommConfig,
{
    T::ALL
        .iter()
        .filter(|&&option| accepts(driver, &with(*base, option)))
        .fold(0, |mask, option| mask | (1 << option.mask_bit()))
}

fn baud_limits(driver: &mut dyn UsartDriver, base: &CommConfig) -> (u32, u32) {
    let with_baud = |baud_rate| CommConfig { baud_rate, ..*base };

    let min_baud = BAUD_RATES
        .iter()
        .copied()
        .find(|&baud| accepts(driver, &with_baud(baud)))
        .unwrap_or(BAUD_RATES[BAUD_RATES.len() - 1]);

    let mut max_baud = BAUD_RATES
        .iter()
        .rev()
        .copied()
        .find(|&baud| accepts(driver, &with_baud(baud)))
        .unwrap_or(BAUD_RATES[0]);

    // The table misses ceilings above 921600 and odd clock dividers
    if let Some(decade) = decade_rates().find(|&baud| accepts(driver, &with_baud(baud))) {
        if decade > max_baud {
            max_baud = decade;
        }
    }

    (min_baud, max_baud)
}

/// Probe the transport and restore `default` afterwards
pub fn probe(
    transport: &mut Transport,
    aux: AuxLines,
    default: &CommConfig,
) -> CapabilitySnapshot {
    let caps = transport.capabilities();
    let driver = transport.driver_mut();
    if let Err(e) = driver.control_rx(false).and_then(|()| driver.control_tx(false)) {
        warn!("Could not disable RX/TX for probing: {}", e);
    }

    let base = CommConfig {
        baud_rate: default.baud_rate,
        ..CommConfig::command_exchange(Mode::Asynchronous)
    };
    let (min_baud, max_baud) = baud_limits(driver, &base);

    let snapshot = CapabilitySnapshot {
        mode_mask: option_mask(driver, &base, |c, mode: Mode| CommConfig { mode, ..c }),
        data_bits_mask: option_mask(driver, &base, |c, data_bits: DataBits| CommConfig {
            data_bits,
            ..c
        }),
        parity_mask: option_mask(driver, &base, |c, parity: Parity| CommConfig { parity, ..c }),
        stop_bits_mask: option_mask(driver, &base, |c, stop_bits: StopBits| CommConfig {
            stop_bits,
            ..c
        }),
        flow_control_mask: option_mask(driver, &base, |c, flow_control: FlowControl| {
            CommConfig { flow_control, ..c }
        }),
        modem_lines_mask: [caps.rts, caps.cts, caps.dtr, caps.dsr, aux.dcd, aux.ri]
            .iter()
            .enumerate()
            .filter(|&(_, &present)| present)
            .fold(0, |mask, (bit, _)| mask | (1 << bit)),
        min_baud,
        max_baud,
    };

    if let Err(e) = transport.configure(default) {
        warn!("Could not restore default configuration after probing: {}", e);
    }
    debug!("Capabilities: {}", snapshot.to_record());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::event_channel;
    use crate::driver::sim::{SimCall, SimProfile, SimulatedUsart};
    use crate::server::state::SharedRunState;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn transport(profile: SimProfile) -> (Transport, crate::driver::sim::SimHandle) {
        let mut sim = SimulatedUsart::new(profile);
        let handle = sim.handle();
        let (tx, rx) = event_channel();
        sim.initialize(tx).unwrap();
        let transport = Transport::new(
            Box::new(sim),
            rx,
            Duration::from_millis(10),
            SharedRunState::default(),
        );
        (transport, handle)
    }

    const BOTH_AUX: AuxLines = AuxLines { dcd: true, ri: true };

    #[test]
    fn test_decade_rate_order() {
        let rates: Vec<u32> = decade_rates().collect();
        assert_eq!(rates[..4], [100_000_000, 50_000_000, 20_000_000, 10_000_000]);
        assert_eq!(rates.last(), Some(&10_000));
        assert_eq!(rates.len(), 13);
    }

    #[test]
    fn test_default_profile_snapshot() {
        let (mut transport, _handle) = transport(SimProfile::default());
        let snapshot = probe(&mut transport, BOTH_AUX, &CommConfig::default());
        assert_eq!(
            snapshot,
            CapabilitySnapshot {
                mode_mask: 0x1B,
                data_bits_mask: 0x1C,
                parity_mask: 0x7,
                stop_bits_mask: 0x3,
                flow_control_mask: 0xF,
                modem_lines_mask: 0x33,
                min_baud: 9_600,
                max_baud: 2_000_000,
            }
        );
        assert_eq!(snapshot.to_record(), "1B,1C,7,3,F,33,9600,2000000");
    }

    #[test]
    fn test_table_ceiling_kept_when_decades_are_lower() {
        let profile = SimProfile {
            min_baud: 19_200,
            max_baud: 921_600,
            ..SimProfile::default()
        };
        let (mut transport, _handle) = transport(profile);
        let snapshot = probe(&mut transport, BOTH_AUX, &CommConfig::default());
        assert_eq!(snapshot.min_baud, 19_200);
        assert_eq!(snapshot.max_baud, 921_600);
    }

    #[test]
    fn test_absent_aux_lines_clear_dcd_ri_bits() {
        let (mut transport, _handle) = transport(SimProfile::default());
        let snapshot = probe(
            &mut transport,
            AuxLines {
                dcd: false,
                ri: false,
            },
            &CommConfig::default(),
        );
        assert_eq!(snapshot.modem_lines_mask, 0x03);
    }

    #[test]
    fn test_probe_is_idempotent_and_restores_default() {
        let (mut transport, handle) = transport(SimProfile::default());
        let default = CommConfig::default();
        let first = probe(&mut transport, BOTH_AUX, &default);
        assert_eq!(handle.current_config(), Some(default));
        let second = probe(&mut transport, BOTH_AUX, &default);
        assert_eq!(first, second);
        assert_eq!(handle.current_config(), Some(default));
    }

    #[test]
    fn test_probe_runs_with_rx_tx_disabled() {
        let (mut transport, handle) = transport(SimProfile::default());
        probe(&mut transport, BOTH_AUX, &CommConfig::default());
        let calls = handle.calls();
        let first_configure = calls
            .iter()
            .position(|c| matches!(c, SimCall::Configure { .. }))
            .unwrap();
        assert!(calls[..first_configure].contains(&SimCall::ControlRx(false)));
        assert!(calls[..first_configure].contains(&SimCall::ControlTx(false)));
    }
}
