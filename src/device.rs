// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::report::RawReport;
use crate::request::ReportRequest;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "attester")]
pub use guest::{exchange, DeviceHandle, GuestDevice};

pub const DEFAULT_DEVICE_PATH: &str = "/dev/tdx_guest";
/// Overrides [`DEFAULT_DEVICE_PATH`] when set.
pub const DEVICE_PATH_ENV: &str = "TDX_GUEST_DEVICE";

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("guest device {} is unavailable", path.display())]
    DeviceUnavailable { path: PathBuf, source: io::Error },
    #[error("report request failed: {}", io::Error::from_raw_os_error(*code))]
    ExchangeFailed { code: i32 },
    #[error("no report within {after:?}")]
    Timeout { after: Duration },
}

impl ExchangeError {
    /// The errno of a failed request, if the device got that far.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExchangeError::DeviceUnavailable { source, .. } => source.raw_os_error(),
            ExchangeError::ExchangeFailed { code } => Some(*code),
            ExchangeError::Timeout { .. } => None,
        }
    }
}

/// Something that turns a report request into a raw TD report, one exchange
/// per call.
pub trait Channel {
    fn exchange(
        &self,
        request: &ReportRequest,
        timeout: Option<Duration>,
    ) -> Result<RawReport, ExchangeError>;
}

/// The device path from [`DEVICE_PATH_ENV`], or the platform default when
/// the variable is unset or empty.
pub fn device_path_from_env() -> PathBuf {
    device_path_or_default(std::env::var_os(DEVICE_PATH_ENV))
}

fn device_path_or_default(value: Option<OsString>) -> PathBuf {
    value
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_PATH))
}

#[cfg(feature = "attester")]
mod sys {
    use crate::tdx::{REPORT_DATA_SIZE, TD_REPORT_SIZE};
    use static_assertions::assert_eq_size;
    use zerocopy::{AsBytes, FromBytes, FromZeroes};

    const TDX_GUEST_IOC_MAGIC: u8 = b'T';
    const TDX_CMD_GET_REPORT0: u8 = 1;

    // struct tdx_report_req from include/uapi/linux/tdx-guest.h
    #[repr(C)]
    #[derive(AsBytes, FromZeroes, FromBytes)]
    pub struct TdxReportReq {
        pub reportdata: [u8; REPORT_DATA_SIZE],
        pub tdreport: [u8; TD_REPORT_SIZE],
    }
    assert_eq_size!(TdxReportReq, [u8; 1088]);

    nix::ioctl_readwrite!(
        tdx_get_report0,
        TDX_GUEST_IOC_MAGIC,
        TDX_CMD_GET_REPORT0,
        TdxReportReq
    );
}

#[cfg(feature = "attester")]
mod guest {
    use super::{device_path_from_env, sys, Channel, ExchangeError};
    use crate::report::RawReport;
    use crate::request::ReportRequest;
    use log::debug;
    use nix::errno::Errno;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;
    use std::time::Duration;
    use zerocopy::FromZeroes;

    /// An open guest device. It is consumed by its single exchange and the
    /// file is closed when it goes out of scope.
    #[derive(Debug)]
    pub struct DeviceHandle {
        file: File,
    }

    impl DeviceHandle {
        pub fn open(path: &Path) -> Result<Self, ExchangeError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|source| ExchangeError::DeviceUnavailable {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(Self { file })
        }

        pub fn get_report(self, request: &ReportRequest) -> Result<RawReport, ExchangeError> {
            let mut req = sys::TdxReportReq::new_zeroed();
            req.reportdata = *request.report_data();

            // SAFETY: req is a live, exclusively borrowed tdx_report_req.
            unsafe { sys::tdx_get_report0(self.file.as_raw_fd(), &mut req) }
                .map_err(|errno| ExchangeError::ExchangeFailed { code: errno as i32 })?;
            Ok(RawReport::new(req.tdreport))
        }
    }

    /// Open `device_path`, issue one report request and close the device.
    pub fn exchange(
        device_path: impl AsRef<Path>,
        request: &ReportRequest,
    ) -> Result<RawReport, ExchangeError> {
        let device_path = device_path.as_ref();
        debug!("requesting TD report from {}", device_path.display());
        DeviceHandle::open(device_path)?.get_report(request)
    }

    #[derive(Clone, Debug)]
    pub struct GuestDevice {
        path: PathBuf,
    }

    impl GuestDevice {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn from_env() -> Self {
            Self::new(device_path_from_env())
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Default for GuestDevice {
        fn default() -> Self {
            Self::from_env()
        }
    }

    impl Channel for GuestDevice {
        /// The report ioctl cannot be polled, so with a timeout the exchange
        /// runs on a worker thread that owns the handle. On expiry the worker
        /// is abandoned and closes the device once the ioctl returns.
        fn exchange(
            &self,
            request: &ReportRequest,
            timeout: Option<Duration>,
        ) -> Result<RawReport, ExchangeError> {
            let Some(after) = timeout else {
                return exchange(&self.path, request);
            };

            let (tx, rx) = mpsc::channel();
            let path = self.path.clone();
            let request = *request;
            thread::Builder::new()
                .name("tdx-report".into())
                .spawn(move || {
                    // the receiver is gone if the caller already timed out
                    let _ = tx.send(exchange(&path, &request));
                })
                .map_err(|e| ExchangeError::ExchangeFailed {
                    code: e.raw_os_error().unwrap_or(Errno::EAGAIN as i32),
                })?;

            match rx.recv_timeout(after) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(ExchangeError::Timeout { after }),
                Err(RecvTimeoutError::Disconnected) => Err(ExchangeError::ExchangeFailed {
                    code: Errno::EIO as i32,
                }),
            }
        }
    }
}

#[cfg(all(test, feature = "attester"))]
mod tests {
    use super::*;
    use crate::request;
    use nix::errno::Errno;
    use std::fs;

    #[test]
    fn missing_device_is_unavailable() {
        let request = request::build(b"nonce").unwrap();
        let err = exchange("/nonexistent/tdx_guest", &request).unwrap_err();
        assert!(matches!(err, ExchangeError::DeviceUnavailable { .. }));
        assert_eq!(err.code(), Some(Errno::ENOENT as i32));
    }

    #[test]
    fn non_device_rejects_report_ioctl() {
        let path = std::env::temp_dir().join(format!("tdx-guest-{}", std::process::id()));
        fs::write(&path, [0u8; 16]).unwrap();

        let request = request::build(b"nonce").unwrap();
        let result = GuestDevice::new(&path).exchange(&request, None);
        fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, ExchangeError::ExchangeFailed { .. }));
        assert_eq!(err.code(), Some(Errno::ENOTTY as i32));
    }

    #[test]
    fn timeout_path_still_reports_device_errors() {
        let device = GuestDevice::new("/nonexistent/tdx_guest");
        let request = request::build(b"nonce").unwrap();
        let err = device
            .exchange(&request, Some(Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::DeviceUnavailable { .. }));
    }

}
