//! Reset and boot-mode strap control for the NCP

/// The two output pins the supervisor drives to hard-reset the NCP.
///
/// The reset line is active while asserted; the bootloader strap is
/// sampled by the NCP's ROM while it comes out of reset, so it must be
/// held through the reset pulse and released only after the boot settle
/// delay. The supervisor owns the pulse timing; implementations only
/// translate the two levels to the board's polarity.
pub trait ResetControl {
    /// Drives the NCP reset line.
    fn set_reset(&self, asserted: bool);

    /// Drives the bootloader strap. `enabled = false` returns the pin to
    /// its inactive (application boot) state.
    fn set_bootloader_mode(&self, enabled: bool);
}
