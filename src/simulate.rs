// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process stand-in for the guest device.
//!
//! Reports have the TD report layout and echo the request's report data, but
//! carry fixed fake measurements and a MAC no TDX module produced. Each
//! report mixes in a counter, so two reports for the same request differ.

use crate::device::{Channel, ExchangeError};
use crate::report::RawReport;
use crate::request::ReportRequest;
use crate::tdx::{
    Measurement, TdReport, MEASUREMENT_SIZE, TDX_REPORT_SUBTYPE, TDX_REPORT_TYPE, TD_REPORT_SIZE,
};
use sha2::{Digest, Sha256, Sha384};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use zerocopy::{AsBytes, FromZeroes};

const SIMULATED_REPORT_VERSION: u8 = 1;

#[derive(Debug, Default)]
pub struct SimulatedDevice {
    counter: AtomicU64,
    latency: Option<Duration>,
}

fn measurement(label: &str) -> Measurement {
    let mut value = [0u8; MEASUREMENT_SIZE];
    value.copy_from_slice(&Sha384::digest(label.as_bytes()));
    value
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every exchange, to exercise deadlines.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Number of reports produced so far.
    pub fn reports_issued(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn build_report(&self, request: &ReportRequest) -> RawReport {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut report = TdReport::new_zeroed();
        let mac = &mut report.report_mac;
        mac.report_type.r#type = TDX_REPORT_TYPE;
        mac.report_type.subtype = TDX_REPORT_SUBTYPE;
        mac.report_type.version = SIMULATED_REPORT_VERSION;
        mac.cpu_svn = [0x01; 16];
        mac.tee_tcb_info_hash = measurement("TEE_TCB_INFO");
        mac.tee_info_hash = measurement("TEE_INFO");
        mac.report_data = *request.report_data();

        let mut hasher = Sha256::new();
        hasher.update(count.to_le_bytes());
        hasher.update(mac.report_data);
        mac.mac = hasher.finalize().into();

        let td_info = &mut report.td_info;
        td_info.mrtd = measurement("MRTD");
        for (i, rtmr) in td_info.rtmr.iter_mut().enumerate() {
            rtmr.register_data = measurement(&format!("RTMR{i}"));
        }

        let mut bytes = [0u8; TD_REPORT_SIZE];
        bytes.copy_from_slice(report.as_bytes());
        RawReport::new(bytes)
    }
}

impl Channel for SimulatedDevice {
    fn exchange(
        &self,
        request: &ReportRequest,
        timeout: Option<Duration>,
    ) -> Result<RawReport, ExchangeError> {
        if let Some(latency) = self.latency {
            match timeout {
                Some(after) if after < latency => {
                    thread::sleep(after);
                    return Err(ExchangeError::Timeout { after });
                }
                _ => thread::sleep(latency),
            }
        }
        Ok(self.build_report(request))
    }
}
