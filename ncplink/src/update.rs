//! Firmware-update handoff
//!
//! The NCP's ROM bootloader speaks a byte-level handshake over the same
//! console, with flow control off: a newline syncs the prompt, `x`
//! initiates an upload, and the bootloader answers `C` to start an
//! XMODEM-CRC transfer. The session must be finalized before the handoff;
//! the supervisor re-initializes around the version queries.
//!
//! Firmware images begin with a newline-terminated version string. When it
//! matches the running NCP's version the upload is skipped.

use embassy_time::{Duration, Instant, Timer};
use heapless::String;
use ncplink_core::Error;
use ncplink_driver::console::{Console, ConsoleConfig};
use ncplink_driver::reset::ResetControl;

use crate::config::VERSION_STRING_SIZE;
use crate::driver::{Client, Driver, InitMode, SessionState};

const UPDATE_ATTEMPTS: usize = 3;
const VERSION_REQUEST_ATTEMPTS: usize = 2;
const START_OF_TRANSFER_ATTEMPTS: usize = 2;

const BOOTLOADER_BAUD: u32 = 115_200;
const PROMPT_SETTLE: Duration = Duration::from_millis(100);
const SEND_DEADLINE: Duration = Duration::from_millis(5);
const RESPONSE_DEADLINE: Duration = Duration::from_millis(1000);
const VERSION_CHAR_DEADLINE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const VERSION_TERMINATOR: u8 = b'\n';

const XMODEM_PAYLOAD: usize = 128;
const XMODEM_RETRIES: usize = 10;
const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;

/// Byte source for a firmware image.
pub trait FirmwareImage {
    /// Positions the read cursor at `pos` bytes from the start.
    fn seek(&mut self, pos: usize) -> Result<(), Error>;

    /// Reads up to `buf.len()` bytes; 0 means end of image.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// Outcome of [`Driver::update_firmware`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateOutcome {
    /// The image was uploaded and the NCP rebooted into it.
    Updated,
    /// The NCP already runs the image's version; nothing was sent.
    AlreadyCurrent,
}

impl<'d, 'b, C: Console, R: ResetControl, CL: Client> Driver<'d, 'b, C, R, CL> {
    /// Updates the NCP application image, gated on the version string at
    /// the head of the image.
    pub async fn update_firmware(
        &mut self,
        image: &mut impl FirmwareImage,
    ) -> Result<UpdateOutcome, Error> {
        if self.session != SessionState::Uninitialized {
            return Err(Error::InvalidState);
        }

        let file_version = read_image_version(image)?;

        // A version query failing may just mean there is no application
        // image on the NCP yet; proceed with the upload.
        if let Ok(ncp_version) = self.query_ncp_version().await
            && ncp_version == file_version
        {
            info!("no update needed, same versions");
            return Ok(UpdateOutcome::AlreadyCurrent);
        }
        info!("updating NCP firmware");

        let mut result = Err(Error::Failed);
        for _ in 0..UPDATE_ATTEMPTS {
            image.seek(file_version.len() + 1)?;
            result = self.upload(image).await;
            if result.is_ok() {
                break;
            }
        }
        result?;

        let version = self.query_ncp_version().await?;
        info!("version read from NCP: {}", version.as_str());
        Ok(UpdateOutcome::Updated)
    }

    /// The bootloader's own version line, via the `v` command.
    pub async fn bootloader_version(&mut self) -> Result<String<VERSION_STRING_SIZE>, Error> {
        if self.session != SessionState::Uninitialized {
            return Err(Error::InvalidState);
        }

        let mut result = self.enter_bootloader().await;

        if result.is_ok() {
            result = self.write_modem(&[VERSION_TERMINATOR]).await;
        }

        let mut version = Err(Error::Failed);
        if result.is_ok() {
            for _ in 0..VERSION_REQUEST_ATTEMPTS {
                version = self.query_bootloader_version().await;
                if version.is_ok() {
                    break;
                }
            }
        }

        self.exit_bootloader().await;
        version
    }

    /// Brings the session up just long enough to read the NCP version.
    async fn query_ncp_version(&mut self) -> Result<String<VERSION_STRING_SIZE>, Error> {
        self.initialize(InitMode::Reset).await?;
        let version = self.ncp_version().await;
        let _ = self.finalize().await;
        version
    }

    async fn upload(&mut self, image: &mut impl FirmwareImage) -> Result<(), Error> {
        let mut result = self.enter_bootloader().await;
        if result.is_ok() {
            result = self.initiate_upload().await;
        }
        if result.is_ok() {
            result = self.xmodem_send(image).await;
        }

        if result.is_err() {
            error!("firmware upload failed: {:?}", result);
        }
        self.exit_bootloader().await;
        result
    }

    async fn enter_bootloader(&mut self) -> Result<(), Error> {
        self.hard_reset(true).await;

        self.console.enable(&ConsoleConfig::bootloader(BOOTLOADER_BAUD));
        self.console.set_rx_irq_enabled(false);

        // There is no prompt to wait for; a newline plus a short settle
        // gives the bootloader time to come up.
        self.write_modem(&[VERSION_TERMINATOR]).await?;
        Timer::after(PROMPT_SETTLE).await;
        Ok(())
    }

    async fn exit_bootloader(&mut self) {
        self.hard_reset(false).await;
        self.console.disable();
    }

    async fn initiate_upload(&mut self) -> Result<(), Error> {
        for _ in 0..START_OF_TRANSFER_ATTEMPTS {
            self.console.flush();
            self.write_modem(b"x").await?;

            if self.find_char(b'C', RESPONSE_DEADLINE).await.is_ok() {
                return Ok(());
            }
        }
        Err(Error::NoFrameReceived)
    }

    async fn xmodem_send(&mut self, image: &mut impl FirmwareImage) -> Result<(), Error> {
        let mut block: u8 = 1;

        loop {
            let mut payload = [0x1au8; XMODEM_PAYLOAD];
            let n = image.read(&mut payload)?;
            if n == 0 {
                break;
            }

            let crc = crc16_xmodem(&payload);
            let mut retries = XMODEM_RETRIES;
            loop {
                self.write_modem(&[SOH, block, !block]).await?;
                self.write_modem(&payload).await?;
                self.write_modem(&crc.to_be_bytes()).await?;

                match self.wait_char(RESPONSE_DEADLINE).await? {
                    ACK => break,
                    CAN => return Err(Error::Failed),
                    _nak => {
                        retries -= 1;
                        if retries == 0 {
                            return Err(Error::Failed);
                        }
                    }
                }
            }

            block = block.wrapping_add(1);
            if n < XMODEM_PAYLOAD {
                break;
            }
        }

        self.write_modem(&[EOT]).await?;
        match self.wait_char(RESPONSE_DEADLINE).await? {
            ACK => Ok(()),
            _ => Err(Error::Failed),
        }
    }

    async fn query_bootloader_version(&mut self) -> Result<String<VERSION_STRING_SIZE>, Error> {
        self.console.flush();
        self.write_modem(b"v").await?;

        let mut line: String<VERSION_STRING_SIZE> = String::new();
        loop {
            match self.wait_char(VERSION_CHAR_DEADLINE).await {
                Ok(byte) if byte == VERSION_TERMINATOR => return Ok(line),
                Ok(byte) => {
                    if line.push(byte as char).is_err() {
                        return Err(Error::NoBufs);
                    }
                }
                Err(_) if !line.is_empty() => {
                    // Older bootloaders stop short of the newline; take
                    // what arrived.
                    return Ok(line);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes bytes, polling transmit readiness on a short deadline.
    async fn write_modem(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &byte in bytes {
            let deadline = Instant::now() + SEND_DEADLINE;
            while !self.console.can_put() {
                if Instant::now() >= deadline {
                    return Err(Error::Busy);
                }
                Timer::after(POLL_INTERVAL).await;
            }
            self.console.put(byte);
        }
        Ok(())
    }

    async fn wait_char(&mut self, deadline: Duration) -> Result<u8, Error> {
        let limit = Instant::now() + deadline;
        loop {
            if let Some(byte) = self.console.try_get() {
                return Ok(byte);
            }
            if Instant::now() >= limit {
                return Err(Error::NoFrameReceived);
            }
            Timer::after(POLL_INTERVAL).await;
        }
    }

    async fn find_char(&mut self, wanted: u8, deadline: Duration) -> Result<(), Error> {
        let limit = Instant::now() + deadline;
        loop {
            if let Some(byte) = self.console.try_get() {
                if byte == wanted {
                    return Ok(());
                }
                continue;
            }
            if Instant::now() >= limit {
                return Err(Error::NoFrameReceived);
            }
            Timer::after(POLL_INTERVAL).await;
        }
    }
}

/// Reads the newline-terminated version string at the head of the image.
fn read_image_version(
    image: &mut impl FirmwareImage,
) -> Result<String<VERSION_STRING_SIZE>, Error> {
    image.seek(0)?;

    let mut buf = [0u8; VERSION_STRING_SIZE];
    let n = image.read(&mut buf)?;

    let head = &buf[..n];
    let terminator = head
        .iter()
        .position(|&b| b == VERSION_TERMINATOR)
        .ok_or(Error::Parse)?;

    let version = core::str::from_utf8(&head[..terminator]).map_err(|_| Error::Parse)?;
    String::try_from(version).map_err(|_| Error::Parse)
}

/// CRC-16/XMODEM: polynomial 0x1021, init 0, no reflection.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
