// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::request::ReportRequest;
use crate::tdx::{
    Measurement, ReportType, ReservedRegion, Rtmr, TdReport, TeeTcbInfo, REPORT_DATA_SIZE,
    RTMR_COUNT, TDX_REPORT_SUBTYPE, TDX_REPORT_TYPE, TDX_REPORT_VERSIONS, TD_REPORT_SIZE,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use static_assertions::assert_not_impl_any;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Malformed {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("unexpected report type {0:?}")]
    ReportType(ReportType),
    #[error("reserved region {} is not zero", .0.name())]
    Reserved(ReservedRegion),
    #[error("binary parse error")]
    Binary(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed report: {0}")]
    MalformedReport(#[from] Malformed),
    #[error("report data does not match the request")]
    BindingMismatch,
}

/// What to do with non-zero bytes in reserved regions.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReservedPolicy {
    #[default]
    Reject,
    /// Accept the report, but list the offending regions on it.
    Flag,
}

/// A TD report as returned by the guest device, not yet validated.
#[derive(Clone, Debug, PartialEq)]
pub struct RawReport {
    bytes: [u8; TD_REPORT_SIZE],
}

impl RawReport {
    pub fn new(bytes: [u8; TD_REPORT_SIZE]) -> Self {
        Self { bytes }
    }

    /// Wrap a captured report, e.g. one read back from a file.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        let bytes: [u8; TD_REPORT_SIZE] =
            bytes.try_into().map_err(|_| Malformed::Length {
                expected: TD_REPORT_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; TD_REPORT_SIZE] {
        &self.bytes
    }

    pub fn into_bytes(self) -> [u8; TD_REPORT_SIZE] {
        self.bytes
    }
}

/// A TD report that passed [`decode`]. It can be serialized for export, but
/// only [`decode`] and [`parse`] construct one.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ParsedReport {
    td_report: TdReport,
    flagged_regions: Vec<ReservedRegion>,
}

impl ParsedReport {
    pub fn td_report(&self) -> &TdReport {
        &self.td_report
    }

    pub fn report_type(&self) -> ReportType {
        self.td_report.report_mac.report_type
    }

    pub fn report_data(&self) -> &[u8; REPORT_DATA_SIZE] {
        &self.td_report.report_mac.report_data
    }

    /// MRTD, the build-time measurement of the TD.
    pub fn mrtd(&self) -> &Measurement {
        &self.td_report.td_info.mrtd
    }

    pub fn rtmrs(&self) -> &[Rtmr; RTMR_COUNT] {
        &self.td_report.td_info.rtmr
    }

    pub fn tee_tcb_info_hash(&self) -> &Measurement {
        &self.td_report.report_mac.tee_tcb_info_hash
    }

    pub fn tee_tcb_info(&self) -> &TeeTcbInfo {
        &self.td_report.tee_tcb_info
    }

    /// MRSEAM, the measurement of the TDX module.
    pub fn mr_seam(&self) -> &Measurement {
        &self.td_report.tee_tcb_info.mr_seam
    }

    pub fn tee_info_hash(&self) -> &Measurement {
        &self.td_report.report_mac.tee_info_hash
    }

    pub fn mac(&self) -> &[u8; 32] {
        &self.td_report.report_mac.mac
    }

    /// Reserved regions found non-zero under [`ReservedPolicy::Flag`].
    pub fn flagged_regions(&self) -> &[ReservedRegion] {
        &self.flagged_regions
    }
}

impl From<ParsedReport> for TdReport {
    fn from(report: ParsedReport) -> Self {
        report.td_report
    }
}

assert_not_impl_any!(ParsedReport: serde::de::DeserializeOwned);

/// Structural checks only, for reports captured without their request.
pub fn decode(raw: &RawReport, policy: ReservedPolicy) -> Result<ParsedReport, ParseError> {
    let td_report: TdReport = bincode::deserialize(raw.as_bytes()).map_err(Malformed::from)?;

    let report_type = td_report.report_mac.report_type;
    if report_type.r#type != TDX_REPORT_TYPE
        || report_type.subtype != TDX_REPORT_SUBTYPE
        || !TDX_REPORT_VERSIONS.contains(&report_type.version)
        || report_type.reserved_mbz != 0
    {
        return Err(Malformed::ReportType(report_type).into());
    }

    let mut flagged_regions = Vec::new();
    for region in ReservedRegion::ALL {
        if raw.as_bytes()[region.range()].iter().all(|b| *b == 0) {
            continue;
        }
        match policy {
            ReservedPolicy::Reject => return Err(Malformed::Reserved(region).into()),
            ReservedPolicy::Flag => {
                warn!("reserved region {} of TD report is not zero", region.name());
                flagged_regions.push(region);
            }
        }
    }

    debug!(
        "decoded TD report version {} ({} flagged regions)",
        report_type.version,
        flagged_regions.len()
    );
    Ok(ParsedReport {
        td_report,
        flagged_regions,
    })
}

/// Decode a TD report and check it echoes the report data of `expected`.
pub fn parse(
    raw: &RawReport,
    expected: &ReportRequest,
    policy: ReservedPolicy,
) -> Result<ParsedReport, ParseError> {
    let report = decode(raw, policy)?;
    if report.report_data() != expected.report_data() {
        return Err(ParseError::BindingMismatch);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request;
    use crate::tdx::{REPORT_DATA_RANGE, REPORT_TYPE_RANGE};
    use zerocopy::{AsBytes, FromZeroes};

    const FIXTURE: &[u8] = include_bytes!("../test/td-report.bin");

    fn fixture() -> RawReport {
        RawReport::from_slice(FIXTURE).unwrap()
    }

    fn fixture_request() -> ReportRequest {
        request::build(b"test_nonce").unwrap()
    }

    #[test]
    fn parse_td_report() {
        let report = parse(&fixture(), &fixture_request(), ReservedPolicy::Reject).unwrap();
        assert_eq!(report.report_type().r#type, TDX_REPORT_TYPE);
        assert_eq!(&report.report_data()[..10], b"test_nonce");
        assert!(report.flagged_regions().is_empty());
        assert_ne!(report.mrtd(), &[0u8; 48], "mrtd {}", hex::encode(report.mrtd()));
        assert_ne!(report.mr_seam(), &[0u8; 48]);
        assert_eq!(report.tee_tcb_info().tee_tcb_svn[0], 0x05);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = RawReport::from_slice(&FIXTURE[..1023]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MalformedReport(Malformed::Length {
                expected: 1024,
                actual: 1023
            })
        ));
    }

    #[test]
    fn flipped_marker_byte_is_malformed() {
        let regions = ReservedRegion::ALL.iter().map(|r| r.range());
        for range in regions.chain(std::iter::once(REPORT_TYPE_RANGE)) {
            for offset in range {
                let mut bytes = fixture().into_bytes();
                bytes[offset] ^= 0xFF;
                let result = parse(
                    &RawReport::new(bytes),
                    &fixture_request(),
                    ReservedPolicy::Reject,
                );
                assert!(
                    matches!(result, Err(ParseError::MalformedReport(_))),
                    "offset {offset} was accepted"
                );
            }
        }
    }

    #[test]
    fn flag_policy_lists_dirty_regions() {
        let mut bytes = fixture().into_bytes();
        bytes[ReservedRegion::TdInfoReserved.range().start] = 1;
        let raw = RawReport::new(bytes);

        let report = decode(&raw, ReservedPolicy::Flag).unwrap();
        assert_eq!(report.flagged_regions(), &[ReservedRegion::TdInfoReserved]);

        // the report type marker is never tolerated
        let mut bytes = raw.into_bytes();
        bytes[REPORT_TYPE_RANGE.start] = 0x00;
        let err = decode(&RawReport::new(bytes), ReservedPolicy::Flag).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MalformedReport(Malformed::ReportType(_))
        ));
    }

    #[test]
    fn zeroed_report_is_rejected() {
        let forged = TdReport::new_zeroed();
        let bytes: [u8; TD_REPORT_SIZE] = forged.as_bytes().try_into().unwrap();
        let err = decode(&RawReport::new(bytes), ReservedPolicy::Flag).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MalformedReport(Malformed::ReportType(_))
        ));

        // an exported report re-enters only through decode
        let report = parse(&fixture(), &fixture_request(), ReservedPolicy::Reject).unwrap();
        let exported = bincode::serialize(&report).unwrap();
        let reread = RawReport::from_slice(&exported[..TD_REPORT_SIZE]).unwrap();
        assert!(decode(&reread, ReservedPolicy::Reject).is_ok());
    }

    #[test]
    fn swapped_report_data_breaks_binding() {
        let mut bytes = fixture().into_bytes();
        bytes[REPORT_DATA_RANGE].copy_from_slice(&[0x42; REPORT_DATA_SIZE]);
        let err = parse(
            &RawReport::new(bytes),
            &fixture_request(),
            ReservedPolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::BindingMismatch));
    }

    #[test]
    fn decode_ignores_binding() {
        let report = decode(&fixture(), ReservedPolicy::Reject).unwrap();
        let other = request::build(b"other_nonce").unwrap();
        assert!(matches!(
            parse(&fixture(), &other, ReservedPolicy::Reject),
            Err(ParseError::BindingMismatch)
        ));
        assert_eq!(report.report_data(), fixture_request().report_data());
    }
}
