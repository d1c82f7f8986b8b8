use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;
#[cfg(feature = "bluez")]
use std::time::Instant;

#[cfg(feature = "bluez")]
use bluer::agent::{Agent, RequestConfirmationFn, RequestPinCodeFn};
#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{AdapterEvent, Address, Session};
#[cfg(feature = "bluez")]
use futures::StreamExt;
use log::{debug, info, warn};
use nix::sys::socket::{setsockopt, sockopt};
use nix::sys::time::{TimeVal, TimeValLike};
#[cfg(feature = "bluez")]
use tokio::runtime::Runtime;

#[cfg(not(feature = "bluez"))]
use std::thread;

use crate::errors::{BluetoothError, TransportError};
use crate::transport::{read_or_empty, LinkConfig, Transport};

type Result<T> = std::result::Result<T, TransportError>;

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_ushort = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

const SCAN_TIMEOUT_SECS: u64 = 30;
const PAIR_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Opens an RFCOMM link to the oximeter without needing root.
///
/// Behavior depends on build features:
/// - Default: raw RFCOMM socket to an already paired device (you provide the MAC).
/// - With `bluez`: waits for the device to show up, pairs it if needed (using
///   `pin` when BlueZ asks for one), then connects through BlueZ.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub scan_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub pair_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub pin: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

impl BluetoothConnector {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            channel: config.rfcomm_channel,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: config.bluetooth_timeout,
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            pair_timeout: Duration::from_secs(PAIR_TIMEOUT_SECS),
            pin: config.pin.clone(),
            max_retries: config.connect_retries.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// Delay before retry `attempt` (1-based), doubling up to 8x.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << (attempt - 1).min(3))
    }
}

#[cfg(feature = "bluez")]
impl BluetoothConnector {
    /// Pair if needed and open an RFCOMM stream, retrying flaky connects.
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let rt = Runtime::new().map_err(TransportError::Io)?;
        rt.block_on(self.connect_async(mac))
    }

    async fn connect_async(&self, mac: &str) -> Result<RfcommStream> {
        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;

        let address: Address = mac
            .parse()
            .map_err(|_| BluetoothError::InvalidAddress(mac.to_string()))?;

        let _agent_handle = match &self.pin {
            Some(pin) => Some(
                session
                    .register_agent(build_agent(pin.clone()))
                    .await
                    .map_err(|e| BluetoothError::Pairing(e.to_string()))?,
            ),
            None => None,
        };

        wait_for_device(&adapter, address, self.scan_timeout).await?;
        let device = adapter.device(address).map_err(connection_error)?;

        if !device.is_paired().await.unwrap_or(false) {
            info!("pairing oximeter via bluer: mac={}", mac);
            tokio::time::timeout(self.pair_timeout, device.pair())
                .await
                .map_err(|_| TransportError::Timeout("pairing timed out".into()))?
                .map_err(|e| BluetoothError::Pairing(e.to_string()))?;
        }

        // Best effort; an untrusted device still connects once paired.
        let _ = device.set_trusted(true).await;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                tokio::time::sleep(delay).await;
            }

            match open_rfcomm(address, self.channel, self.connect_timeout, self.read_timeout).await
            {
                Ok(stream) => {
                    if let Err(e) = stream.verify_connected() {
                        warn!("connection verification failed: mac={}, error={}", mac, e);
                        last_error = Some(e);
                        continue;
                    }
                    info!("RFCOMM connection established: mac={}", mac);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BluetoothError::NotConnected("max retries exceeded".into()).into()
        }))
    }
}

#[cfg(not(feature = "bluez"))]
impl BluetoothConnector {
    /// Connect to an already paired oximeter using only libc sockets.
    ///
    /// Pair and trust the device beforehand (e.g. with `bluetoothctl`).
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(mac)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                thread::sleep(delay);
            }

            match open_rfcomm_raw(bdaddr, self.channel, self.connect_timeout, self.read_timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.verify_connected() {
                        warn!("connection verification failed: mac={}, error={}", mac, e);
                        last_error = Some(e);
                        continue;
                    }
                    info!("RFCOMM connection established: mac={}", mac);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BluetoothError::NotConnected("max retries exceeded".into()).into()
        }))
    }
}

/// Blocking RFCOMM socket with a per-call receive timeout.
pub struct RfcommStream {
    file: Option<File>,
    read_timeout: Duration,
}

impl RfcommStream {
    /// Check `SO_ERROR` so a half-open connect is caught before first use.
    pub fn verify_connected(&self) -> Result<()> {
        let file = self.file()?;
        let mut err: libc::c_int = 0;
        let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if err != 0 {
            return Err(BluetoothError::NotConnected(
                std::io::Error::from_raw_os_error(err).to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(TransportError::Closed)
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(TransportError::Closed)
    }

    /// Re-arm `SO_RCVTIMEO` if the requested timeout differs from the current one.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout == self.read_timeout {
            return Ok(());
        }
        setsockopt(self.file()?, sockopt::ReceiveTimeout, &timeval(timeout))
            .map_err(|e| TransportError::Io(e.into()))?;
        self.read_timeout = timeout;
        Ok(())
    }
}

impl Transport for RfcommStream {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.set_read_timeout(timeout)?;
        let res = self.file_mut()?.read(buf);
        read_or_empty(res)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            // The peer sees the disconnect even if another fd still refers to the socket.
            unsafe {
                libc::shutdown(file.as_raw_fd(), libc::SHUT_RDWR);
            }
            debug!("closed RFCOMM socket");
        }
        Ok(())
    }
}

#[cfg(feature = "bluez")]
fn connection_error(e: bluer::Error) -> TransportError {
    BluetoothError::Connection(e.to_string()).into()
}

#[cfg(feature = "bluez")]
fn build_agent(pin: String) -> Agent {
    let pin_code_fn: RequestPinCodeFn = Box::new(move |_req| {
        let pin = pin.clone();
        Box::pin(async move { Ok(pin) })
    });

    let confirm_fn: RequestConfirmationFn = Box::new(|_req| Box::pin(async { Ok(()) }));

    Agent {
        request_default: true,
        request_pin_code: Some(pin_code_fn),
        request_confirmation: Some(confirm_fn),
        ..Default::default()
    }
}

#[cfg(feature = "bluez")]
async fn wait_for_device(adapter: &bluer::Adapter, address: Address, timeout: Duration) -> Result<()> {
    if adapter.device_addresses().await.map_err(connection_error)?.contains(&address) {
        return Ok(());
    }

    let mut events = adapter.discover_devices().await.map_err(connection_error)?;
    let deadline = Instant::now() + timeout;
    let not_found = || -> TransportError {
        BluetoothError::NotFound {
            mac: address.to_string(),
        }
        .into()
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.next()).await {
            Ok(Some(AdapterEvent::DeviceAdded(addr))) if addr == address => {
                info!("oximeter discovered: mac={}", addr);
                return Ok(());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return Err(not_found()),
        }
    }
}

/// Apply `SO_RCVTIMEO`/`SO_SNDTIMEO` to a freshly opened socket.
fn set_io_timeouts(socket: &File, read: Duration, write: Duration) -> Result<()> {
    let connection_error = |e: nix::Error| -> TransportError {
        BluetoothError::Connection(std::io::Error::from(e).to_string()).into()
    };
    setsockopt(socket, sockopt::ReceiveTimeout, &timeval(read)).map_err(connection_error)?;
    setsockopt(socket, sockopt::SendTimeout, &timeval(write)).map_err(connection_error)?;
    Ok(())
}

fn timeval(timeout: Duration) -> TimeVal {
    TimeVal::microseconds(timeout.as_micros() as i64)
}

/// Take ownership of `fd`, closing it if any setup step fails.
fn finish_socket(fd: libc::c_int, setup: impl FnOnce(&File) -> Result<()>) -> Result<File> {
    let file = unsafe { File::from_raw_fd(fd) };
    setup(&file)?;
    Ok(file)
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(
    address: Address,
    channel: u8,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<RfcommStream> {
    debug!("opening RFCOMM socket: mac={}, channel={}", address, channel);

    let target = SocketAddr::new(address, channel);
    let stream = tokio::time::timeout(connect_timeout, Stream::connect(target))
        .await
        .map_err(|_| TransportError::Timeout("rfcomm connect timed out".into()))?
        .map_err(|e| BluetoothError::Connection(e.to_string()))?;

    // Own a blocking duplicate of the fd, independent of the async stream.
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(BluetoothError::Connection(std::io::Error::last_os_error().to_string()).into());
    }

    let file = finish_socket(fd, |socket| {
        let fd = socket.as_raw_fd();
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        set_io_timeouts(socket, read_timeout, connect_timeout)
    })?;

    Ok(RfcommStream {
        file: Some(file),
        read_timeout,
    })
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

#[cfg(not(feature = "bluez"))]
fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let invalid = || TransportError::from(BluetoothError::InvalidAddress(mac.to_string()));
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    // bdaddr_t stores bytes in reverse order compared to the usual MAC string
    let mut addr = BdAddr { b: [0; 6] };
    for (i, part) in parts.iter().enumerate() {
        addr.b[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(addr)
}

#[cfg(not(feature = "bluez"))]
fn open_rfcomm_raw(
    address: BdAddr,
    channel: u8,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket (manual): channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH as libc::c_int,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(BluetoothError::Connection(std::io::Error::last_os_error().to_string()).into());
    }

    let file = finish_socket(fd, |socket| {
        let addr = SockAddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: address,
            rc_channel: channel,
        };
        // The send timeout also bounds the blocking connect.
        set_io_timeouts(socket, read_timeout, connect_timeout)?;
        let ret = unsafe {
            libc::connect(
                socket.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockAddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(BluetoothError::Connection(std::io::Error::last_os_error().to_string()).into());
        }
        Ok(())
    })?;

    Ok(RfcommStream {
        file: Some(file),
        read_timeout,
    })
}

#[cfg(all(test, not(feature = "bluez")))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn bdaddr_is_stored_little_endian() {
        let addr = parse_bdaddr("00:1C:05:AB:CD:EF").unwrap();
        assert_eq!([0xEF, 0xCD, 0xAB, 0x05, 0x1C, 0x00], addr.b);
    }

    #[test]
    fn malformed_mac_is_rejected() {
        assert_matches!(
            parse_bdaddr("00:1C:05:AB:CD"),
            Err(TransportError::Bluetooth(BluetoothError::InvalidAddress(_)))
        );
        assert_matches!(
            parse_bdaddr("00:1C:05:AB:CD:ZZ"),
            Err(TransportError::Bluetooth(BluetoothError::InvalidAddress(_)))
        );
    }

    fn socket_pair() -> (File, File) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        (
            File::from(std::os::fd::OwnedFd::from(a)),
            File::from(std::os::fd::OwnedFd::from(b)),
        )
    }

    #[test]
    fn io_timeouts_are_applied_to_the_socket() {
        let (socket, _peer) = socket_pair();
        set_io_timeouts(&socket, Duration::from_millis(250), Duration::from_secs(2)).unwrap();

        let rcv = nix::sys::socket::getsockopt(&socket, sockopt::ReceiveTimeout).unwrap();
        let snd = nix::sys::socket::getsockopt(&socket, sockopt::SendTimeout).unwrap();
        assert_eq!(250_000, rcv.num_microseconds());
        assert_eq!(2_000_000, snd.num_microseconds());
    }

    #[test]
    fn stream_rearms_receive_timeout_and_reads_silence_as_empty() {
        let (socket, mut peer) = socket_pair();
        let mut stream = RfcommStream {
            file: Some(socket),
            read_timeout: Duration::from_secs(1),
        };

        let mut buf = [0u8; 4];
        assert_eq!(0, stream.read_timeout(&mut buf, Duration::from_millis(20)).unwrap());
        let rcv = nix::sys::socket::getsockopt(stream.file().unwrap(), sockopt::ReceiveTimeout).unwrap();
        assert_eq!(20_000, rcv.num_microseconds());

        peer.write_all(&[0x01, 0xE0]).unwrap();
        assert_eq!(2, stream.read_timeout(&mut buf, Duration::from_millis(20)).unwrap());

        stream.close().unwrap();
        assert_matches!(
            stream.read_timeout(&mut buf, Duration::from_millis(20)),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let connector = BluetoothConnector {
            retry_delay: Duration::from_millis(100),
            ..BluetoothConnector::default()
        };
        assert_eq!(Duration::from_millis(100), connector.backoff(1));
        assert_eq!(Duration::from_millis(200), connector.backoff(2));
        assert_eq!(Duration::from_millis(800), connector.backoff(4));
        assert_eq!(Duration::from_millis(800), connector.backoff(9));
    }

    #[test]
    fn connector_follows_link_config() {
        let config = LinkConfig {
            rfcomm_channel: 2,
            connect_retries: 0,
            ..LinkConfig::default()
        };
        let connector = BluetoothConnector::from_config(&config);
        assert_eq!(2, connector.channel);
        assert_eq!(1, connector.max_retries);
        assert_eq!(Duration::from_secs(1), connector.read_timeout);
    }
}
