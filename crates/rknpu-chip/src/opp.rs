//! Operating-point table and DVFS constants.
//!
//! Frequencies up to [`CRU_SCMI_THRESHOLD_HZ`] are reachable through the
//! hardware divider clock (CRU); anything above needs the firmware-mediated
//! clock (SCMI).
//!
//! | Frequency | Voltage |
//! |-----------|---------|
//! | 100–600 MHz | 825 mV |
//! | 700 MHz | 900 mV |
//! | 800 MHz | 950 mV |
//! | 900 MHz | 1000 mV |
//! | 1000 MHz | 1050 mV |

/// One frequency/voltage pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingPoint {
    /// Clock rate in Hz.
    pub freq_hz: u64,
    /// Supply voltage in microvolts.
    pub microvolt: u32,
}

const fn op(mhz: u64, microvolt: u32) -> OperatingPoint {
    OperatingPoint {
        freq_hz: mhz * MHZ,
        microvolt,
    }
}

/// Hz per MHz.
pub const MHZ: u64 = 1_000_000;

/// Operating points in ascending frequency order.
pub const OPP_TABLE: [OperatingPoint; 10] = [
    op(100, 825_000),
    op(200, 825_000),
    op(300, 825_000),
    op(400, 825_000),
    op(500, 825_000),
    op(600, 825_000),
    op(700, 900_000),
    op(800, 950_000),
    op(900, 1_000_000),
    op(1000, 1_050_000),
];

/// Above this rate the firmware clock is preferred.
pub const CRU_SCMI_THRESHOLD_HZ: u64 = 600 * MHZ;

/// Lowest rate the governor will request.
pub const MIN_FREQ_HZ: u64 = 100 * MHZ;

/// Rate assumed when no clock can report one.
pub const DEFAULT_FREQ_HZ: u64 = 600 * MHZ;

/// Default safety ceiling.
pub const DEFAULT_MAX_FREQ_HZ: u64 = 1000 * MHZ;

/// Upper edge of the regulator window above the target voltage.
pub const VOLTAGE_WINDOW_UV: u32 = 50_000;

/// Voltage for an arbitrary rate: the highest point whose frequency does not
/// exceed `freq_hz`, or the first point for rates below the table.
#[must_use]
pub fn voltage_for_freq(freq_hz: u64) -> u32 {
    OPP_TABLE
        .iter()
        .rev()
        .find(|p| freq_hz >= p.freq_hz)
        .unwrap_or(&OPP_TABLE[0])
        .microvolt
}

/// Recommended operating point for a requested rate: the lowest point at or
/// above the request, or the highest point when the request is above the
/// table.
#[must_use]
pub fn recommended(freq_hz: u64) -> OperatingPoint {
    OPP_TABLE
        .iter()
        .copied()
        .find(|p| p.freq_hz >= freq_hz)
        .unwrap_or(OPP_TABLE[OPP_TABLE.len() - 1])
}

/// Highest rate in the table.
#[must_use]
pub const fn table_max_hz() -> u64 {
    OPP_TABLE[OPP_TABLE.len() - 1].freq_hz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        for w in OPP_TABLE.windows(2) {
            assert!(w[0].freq_hz < w[1].freq_hz);
            assert!(w[0].microvolt <= w[1].microvolt);
        }
    }

    #[test]
    fn voltage_lookup_floors() {
        assert_eq!(voltage_for_freq(50 * MHZ), 825_000);
        assert_eq!(voltage_for_freq(600 * MHZ), 825_000);
        assert_eq!(voltage_for_freq(750 * MHZ), 900_000);
        assert_eq!(voltage_for_freq(1000 * MHZ), 1_050_000);
        assert_eq!(voltage_for_freq(1200 * MHZ), 1_050_000);
    }

    #[test]
    fn recommendation_ceils_then_saturates() {
        assert_eq!(recommended(650 * MHZ).freq_hz, 700 * MHZ);
        assert_eq!(recommended(700 * MHZ).freq_hz, 700 * MHZ);
        assert_eq!(recommended(1050 * MHZ).freq_hz, 1000 * MHZ);
        assert_eq!(recommended(0).freq_hz, 100 * MHZ);
    }

    #[test]
    fn threshold_sits_on_a_table_point() {
        assert!(OPP_TABLE.iter().any(|p| p.freq_hz == CRU_SCMI_THRESHOLD_HZ));
        assert_eq!(table_max_hz(), DEFAULT_MAX_FREQ_HZ);
    }
}
