//! Clock wizard driver.
//!
//! The on-fabric clock wizard synthesizes the user clock from a fixed
//! 100 MHz reference through integer divisors: VCO = Fref · M / D, output =
//! VCO / O. Programming loads the divisor fields plus a block of opaque
//! values from the IP's programming guide, pulses the reconfiguration
//! register, and waits for lock.
//!
//! The driver is generic over [`RegisterIo`] so the same code runs against
//! the hardware BAR and against a recording mock in tests.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Register access seam for on-fabric IP drivers.
///
/// Offsets are relative to the IP's base address.
pub trait RegisterIo {
    /// Reads a 32-bit register.
    fn read_reg(&mut self, offset: u32) -> Result<u32>;
    /// Writes a 32-bit register.
    fn write_reg(&mut self, offset: u32, value: u32) -> Result<()>;
}

/// Reference input clock.
const REF_CLK_HZ: u64 = 100_000_000;
/// Accepted |actual − requested| error.
const MIN_ERR_HZ: u64 = 50_000;

const MHZ: u64 = 1_000_000;
const VCO_MIN_MHZ: u64 = 2160;
const VCO_MAX_MHZ: u64 = 4320;
const M_MIN: u32 = 4;
const M_MAX: u32 = 432;
const D_MIN: u32 = 1;
const D_MAX: u32 = 123;
const O_MIN: u32 = 2;
const O_MAX: u32 = 511;

// Register map (offsets relative to the clock wizard base).
const REG_RECONFIG: u32 = 0x014;
const REG1: u32 = 0x330;
const REG2: u32 = 0x334;
const REG3: u32 = 0x338;
const REG4: u32 = 0x33C;
const REG11: u32 = 0x378;
const REG12: u32 = 0x380;
const REG13: u32 = 0x384;
const REG14: u32 = 0x398;
const REG15: u32 = 0x39C;
const REG16: u32 = 0x3A0;
const REG17: u32 = 0x3A8;
const REG25: u32 = 0x3F0;
const REG26: u32 = 0x3FC;

const REG1_PREDIV2: u32 = 1 << 12;
const REG1_EN: u32 = 1 << 9;
const REG1_MX: u32 = 1 << 10;
const REG1_EDGE_SHIFT: u32 = 8;
const REG3_PREDIV2: u32 = 1 << 11;
const REG3_USED: u32 = 1 << 12;
const REG3_MX: u32 = 1 << 9;
const REG3_DIV_EDGE_SHIFT: u32 = 8;
const P5EN_SHIFT: u32 = 13;
const P5FEDGE_SHIFT: u32 = 15;
const REG12_EDGE_SHIFT: u32 = 10;
const RECONFIG_LOAD: u32 = 1;
const RECONFIG_SADDR: u32 = 2;

const LOCK_POLL_PERIOD: Duration = Duration::from_micros(100);
const LOCK_POLL_LIMIT: u32 = 1000;

/// Clock wizard state: the declared ceiling and the loaded divisors.
#[derive(Debug)]
pub struct ClkWiz {
    max_freq_hz: u64,
    m: u32,
    d: u32,
    o: u32,
}

impl ClkWiz {
    /// Creates a driver with the fabric's declared maximum frequency.
    pub fn new(max_freq_hz: u64) -> Self {
        Self {
            max_freq_hz,
            m: 0,
            d: 1,
            o: 1,
        }
    }

    /// The fabric's declared maximum frequency in Hz.
    pub fn max_rate_hz(&self) -> u64 {
        self.max_freq_hz
    }

    /// The output frequency implied by the loaded divisors, in Hz.
    pub fn clock_rate(&self) -> u64 {
        if self.m == 0 {
            return 0;
        }
        REF_CLK_HZ * u64::from(self.m) / u64::from(self.d) / u64::from(self.o)
    }

    /// Programs the user clock to `rate_hz`.
    ///
    /// Requests above the declared maximum clamp to the maximum with a
    /// warning, never an error.
    ///
    /// # Errors
    ///
    /// `ClockNotLocked` when no divisor triple reaches the rate or the
    /// lock poll exhausts its budget.
    pub fn set_rate_hz<R: RegisterIo>(&mut self, regs: &mut R, rate_hz: u64) -> Result<()> {
        let rate_hz = if rate_hz > self.max_freq_hz {
            warn!(
                requested_hz = rate_hz,
                max_hz = self.max_freq_hz,
                "requested rate above fabric maximum; clamping"
            );
            self.max_freq_hz
        } else {
            rate_hz
        };

        let (m, d, o) = solve_divisors(rate_hz).ok_or(Error::ClockNotLocked {
            requested_hz: rate_hz,
        })?;
        debug!(m, d, o, "divisors solved");
        self.m = m;
        self.d = d;
        self.o = o;

        self.update_o(regs)?;
        self.update_d(regs)?;
        self.update_m(regs)?;
        // Opaque values from the IP's programming guide, emitted verbatim.
        regs.write_reg(REG11, 0x2E)?;
        regs.write_reg(REG14, 0xE80)?;
        regs.write_reg(REG15, 0x4271)?;
        regs.write_reg(REG16, 0x43E9)?;
        regs.write_reg(REG17, 0x001C)?;
        regs.write_reg(REG26, 0x0001)?;

        regs.write_reg(REG_RECONFIG, RECONFIG_LOAD | RECONFIG_SADDR)?;
        self.wait_for_lock(regs, rate_hz)?;

        info!(
            rate_mhz = self.clock_rate() as f64 / MHZ as f64,
            "user clock programmed"
        );
        Ok(())
    }

    fn update_o<R: RegisterIo>(&self, regs: &mut R) -> Result<()> {
        let high_time = self.o / 4;
        let div_edge = u32::from(self.o % 4 > 1);
        let p5 = self.o % 2;
        let reg = REG3_PREDIV2
            | REG3_USED
            | REG3_MX
            | (div_edge << REG3_DIV_EDGE_SHIFT)
            | (p5 << P5EN_SHIFT)
            | (p5 << P5FEDGE_SHIFT);
        regs.write_reg(REG3, reg)?;
        regs.write_reg(REG3 + 4, high_time | high_time << 8)
    }

    fn update_d<R: RegisterIo>(&self, regs: &mut R) -> Result<()> {
        let high_time = self.d / 2;
        regs.write_reg(REG12, (self.d % 2) << REG12_EDGE_SHIFT)?;
        regs.write_reg(REG13, high_time | high_time << 8)
    }

    fn update_m<R: RegisterIo>(&self, regs: &mut R) -> Result<()> {
        regs.write_reg(REG25, 0)?;
        let high_time = self.m / 2;
        regs.write_reg(REG2, high_time | high_time << 8)?;
        let mut reg = REG1_PREDIV2 | REG1_EN | REG1_MX;
        if self.m % 2 == 1 {
            reg |= 1 << REG1_EDGE_SHIFT;
        }
        regs.write_reg(REG1, reg)
    }

    fn wait_for_lock<R: RegisterIo>(&self, regs: &mut R, requested_hz: u64) -> Result<()> {
        for _ in 0..LOCK_POLL_LIMIT {
            if regs.read_reg(REG4)? & 1 == 1 {
                debug!("clock locked");
                return Ok(());
            }
            std::thread::sleep(LOCK_POLL_PERIOD);
        }
        Err(Error::ClockNotLocked { requested_hz })
    }
}

/// Searches (M, D, O) in nested order for the first triple hitting
/// `rate_hz` within [`MIN_ERR_HZ`], with the VCO inside its legal band.
fn solve_divisors(rate_hz: u64) -> Option<(u32, u32, u32)> {
    for m in M_MIN..=M_MAX {
        for d in D_MIN..=D_MAX {
            let fvco = REF_CLK_HZ * u64::from(m) / u64::from(d);
            if fvco < VCO_MIN_MHZ * MHZ || fvco > VCO_MAX_MHZ * MHZ {
                continue;
            }
            for o in O_MIN..=O_MAX {
                let freq = fvco / u64::from(o);
                if freq.abs_diff(rate_hz) < MIN_ERR_HZ {
                    return Some((m, d, o));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records writes; reads report an immediately locked clock.
    struct Recorder {
        writes: Vec<(u32, u32)>,
        locked: bool,
    }

    impl Recorder {
        fn new(locked: bool) -> Self {
            Self {
                writes: Vec::new(),
                locked,
            }
        }
    }

    impl RegisterIo for Recorder {
        fn read_reg(&mut self, offset: u32) -> Result<u32> {
            assert_eq!(offset, REG4, "only the status register is polled");
            Ok(u32::from(self.locked))
        }

        fn write_reg(&mut self, offset: u32, value: u32) -> Result<()> {
            self.writes.push((offset, value));
            Ok(())
        }
    }

    // ---- Divisor search -----------------------------------------------------

    #[test]
    fn solves_250_mhz_within_tolerance() {
        let (m, d, o) = solve_divisors(250 * MHZ).unwrap();
        let fvco = REF_CLK_HZ * u64::from(m) / u64::from(d);
        assert!((VCO_MIN_MHZ * MHZ..=VCO_MAX_MHZ * MHZ).contains(&fvco));
        let freq = fvco / u64::from(o);
        assert!(freq.abs_diff(250 * MHZ) < MIN_ERR_HZ);
    }

    #[test]
    fn solves_across_the_usable_band() {
        for rate_mhz in [100u64, 200, 300, 333, 400, 500] {
            let (m, d, o) = solve_divisors(rate_mhz * MHZ)
                .unwrap_or_else(|| panic!("no divisors for {rate_mhz} MHz"));
            assert!((M_MIN..=M_MAX).contains(&m));
            assert!((D_MIN..=D_MAX).contains(&d));
            assert!((O_MIN..=O_MAX).contains(&o));
        }
    }

    #[test]
    fn unreachable_rate_has_no_divisors() {
        // Far below VCO_MIN / O_MAX.
        assert!(solve_divisors(1000).is_none());
    }

    // ---- Programming sequence -----------------------------------------------

    #[test]
    fn write_sequence_starts_with_o_and_ends_with_reconfig() {
        let mut clk = ClkWiz::new(500 * MHZ);
        let mut regs = Recorder::new(true);
        clk.set_rate_hz(&mut regs, 250 * MHZ).unwrap();

        let offsets: Vec<u32> = regs.writes.iter().map(|&(o, _)| o).collect();
        assert_eq!(offsets[0], REG3, "O divisor control word first");
        assert_eq!(offsets[1], REG3 + 4, "O divisor high-time word second");

        let (last_offset, last_value) = *regs.writes.last().unwrap();
        assert_eq!(last_offset, REG_RECONFIG);
        assert_eq!(last_value, RECONFIG_LOAD | RECONFIG_SADDR);
    }

    #[test]
    fn magic_values_are_emitted_verbatim() {
        let mut clk = ClkWiz::new(500 * MHZ);
        let mut regs = Recorder::new(true);
        clk.set_rate_hz(&mut regs, 250 * MHZ).unwrap();

        for (offset, value) in [
            (REG11, 0x2E),
            (REG14, 0xE80),
            (REG15, 0x4271),
            (REG16, 0x43E9),
            (REG17, 0x001C),
            (REG26, 0x0001),
        ] {
            assert!(
                regs.writes.contains(&(offset, value)),
                "missing write {offset:#x} <- {value:#x}"
            );
        }
    }

    #[test]
    fn programmed_rate_matches_request() {
        let mut clk = ClkWiz::new(500 * MHZ);
        let mut regs = Recorder::new(true);
        clk.set_rate_hz(&mut regs, 250 * MHZ).unwrap();
        assert!(clk.clock_rate().abs_diff(250 * MHZ) < MIN_ERR_HZ);
    }

    #[test]
    fn over_maximum_request_clamps_instead_of_failing() {
        let mut clk = ClkWiz::new(300 * MHZ);
        let mut regs = Recorder::new(true);
        clk.set_rate_hz(&mut regs, 450 * MHZ).unwrap();
        assert!(clk.clock_rate().abs_diff(300 * MHZ) < MIN_ERR_HZ);
    }

    #[test]
    fn lock_poll_exhaustion_is_clock_not_locked() {
        let mut clk = ClkWiz::new(500 * MHZ);
        let mut regs = Recorder::new(false);
        assert!(matches!(
            clk.set_rate_hz(&mut regs, 250 * MHZ).unwrap_err(),
            Error::ClockNotLocked { .. }
        ));
    }
}
