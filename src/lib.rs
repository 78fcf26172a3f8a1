// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  This library retrieves and validates TD reports inside [Intel TDX](https://www.intel.com/content/www/us/en/developer/tools/trust-domain-extensions/overview.html)
//!  guests through the `/dev/tdx_guest` device.
//!
//!  A caller supplies up to 64 bytes of user data, typically a verifier nonce or a hash of one.
//!  `request::build()` turns it into a zero-padded report request, `device::exchange()` issues a
//!  single `TDX_CMD_GET_REPORT0` request, and `report::parse()` decodes the 1024-byte TD report,
//!  checks its type marker and reserved regions, and verifies the report echoes the request's
//!  report data. `acquire::acquire()` runs these steps with retry, backoff and deadline options.
//!
//!  Verifying the report's MAC or turning it into a signed quote is left to the caller.
//!
//!  #
//!  ```no_run
//!  use tdx_guest_report::acquire::{self, AcquireOptions, Backoff};
//!  use tdx_guest_report::device::DEFAULT_DEVICE_PATH;
//!  use std::error::Error;
//!  use std::time::Duration;
//!
//!  fn main() -> Result<(), Box<dyn Error>> {
//!    let options = AcquireOptions {
//!      max_attempts: 3,
//!      backoff: Backoff::Fixed { delay: Duration::from_millis(100) },
//!      deadline: Some(Duration::from_secs(5)),
//!      ..Default::default()
//!    };
//!    let acquired = acquire::acquire(DEFAULT_DEVICE_PATH, b"a nonce", &options)?;
//!    let report = acquired.report;
//!    assert_eq!(&report.report_data()[..7], b"a nonce");
//!    println!("MRTD: {:02x?}", report.mrtd());
//!
//!    Ok(())
//!  }
//!  ```

pub mod acquire;
pub mod device;
pub mod report;
pub mod request;
pub mod simulate;
pub mod tdx;

pub use acquire::{AcquireError, AcquireOptions, Acquired, Backoff, Category, Failure};
pub use device::{Channel, ExchangeError};
pub use report::{ParseError, ParsedReport, RawReport, ReservedPolicy};
pub use request::{ReportRequest, RequestError};
