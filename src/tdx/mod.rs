// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Types are based on "Intel TDX Module 1.5 ABI Specification", TDREPORT_STRUCT
// (REPORTMACSTRUCT, TEE_TCB_INFO, TDINFO_STRUCT).

use memoffset::offset_of;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use static_assertions::assert_eq_size;
use std::ops::Range;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const TD_REPORT_SIZE: usize = 1024;
pub const REPORT_DATA_SIZE: usize = 64;
pub const MEASUREMENT_SIZE: usize = 48;
pub const RTMR_COUNT: usize = 4;

/// `REPORTTYPE.TYPE` of a TD report.
pub const TDX_REPORT_TYPE: u8 = 0x81;
pub const TDX_REPORT_SUBTYPE: u8 = 0;
/// Version 0 is emitted by TDX 1.0 modules, version 1 by TDX 1.5.
pub const TDX_REPORT_VERSIONS: [u8; 2] = [0, 1];

pub type Measurement = [u8; MEASUREMENT_SIZE];

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportType {
    pub r#type: u8,
    pub subtype: u8,
    pub version: u8,
    pub reserved_mbz: u8,
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportMac {
    pub report_type: ReportType,
    pub reserved_mbz1: [u8; 12],
    pub cpu_svn: [u8; 16],
    #[serde(with = "BigArray")]
    pub tee_tcb_info_hash: Measurement,
    #[serde(with = "BigArray")]
    pub tee_info_hash: Measurement,
    #[serde(with = "BigArray")]
    pub report_data: [u8; REPORT_DATA_SIZE],
    pub reserved_mbz2: [u8; 32],
    pub mac: [u8; 32],
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TeeTcbInfo {
    pub valid: [u8; 8],
    pub tee_tcb_svn: [u8; 16],
    #[serde(with = "BigArray")]
    pub mr_seam: Measurement,
    #[serde(with = "BigArray")]
    pub mr_signer_seam: Measurement,
    pub attributes: [u8; 8],
    pub tee_tcb_svn2: [u8; 16],
    #[serde(with = "BigArray")]
    pub reserved: [u8; 95],
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rtmr {
    #[serde(with = "BigArray")]
    pub register_data: Measurement,
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdInfo {
    pub attributes: [u8; 8],
    pub xfam: [u8; 8],
    #[serde(with = "BigArray")]
    pub mrtd: Measurement,
    #[serde(with = "BigArray")]
    pub mr_config_id: Measurement,
    #[serde(with = "BigArray")]
    pub mr_owner: Measurement,
    #[serde(with = "BigArray")]
    pub mr_owner_config: Measurement,
    pub rtmr: [Rtmr; RTMR_COUNT],
    #[serde(with = "BigArray")]
    pub serv_td_hash: Measurement,
    #[serde(with = "BigArray")]
    pub reserved_mbz: [u8; 64],
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdReport {
    pub report_mac: ReportMac,
    pub tee_tcb_info: TeeTcbInfo,
    pub reserved_mbz: [u8; 17],
    pub td_info: TdInfo,
}

assert_eq_size!(ReportMac, [u8; 256]);
assert_eq_size!(TeeTcbInfo, [u8; 239]);
assert_eq_size!(TdInfo, [u8; 512]);
assert_eq_size!(TdReport, [u8; TD_REPORT_SIZE]);

const REPORT_MAC_OFFSET: usize = offset_of!(TdReport, report_mac);
const TD_INFO_OFFSET: usize = offset_of!(TdReport, td_info);

const fn field_range(offset: usize, len: usize) -> Range<usize> {
    offset..(offset + len)
}

/// Byte range of the report type marker inside a raw TD report.
pub const REPORT_TYPE_RANGE: Range<usize> = field_range(
    REPORT_MAC_OFFSET + offset_of!(ReportMac, report_type),
    std::mem::size_of::<ReportType>(),
);

/// Byte range of the echoed report data inside a raw TD report.
pub const REPORT_DATA_RANGE: Range<usize> = field_range(
    REPORT_MAC_OFFSET + offset_of!(ReportMac, report_data),
    REPORT_DATA_SIZE,
);

/// Regions of a TD report that the TDX module always leaves zeroed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservedRegion {
    ReportMacReserved1,
    ReportMacReserved2,
    TdReportReserved,
    TdInfoReserved,
}

impl ReservedRegion {
    pub const ALL: [ReservedRegion; 4] = [
        ReservedRegion::ReportMacReserved1,
        ReservedRegion::ReportMacReserved2,
        ReservedRegion::TdReportReserved,
        ReservedRegion::TdInfoReserved,
    ];

    /// Byte range of the region inside a raw TD report.
    pub fn range(self) -> Range<usize> {
        match self {
            ReservedRegion::ReportMacReserved1 => {
                field_range(REPORT_MAC_OFFSET + offset_of!(ReportMac, reserved_mbz1), 12)
            }
            ReservedRegion::ReportMacReserved2 => {
                field_range(REPORT_MAC_OFFSET + offset_of!(ReportMac, reserved_mbz2), 32)
            }
            ReservedRegion::TdReportReserved => {
                field_range(offset_of!(TdReport, reserved_mbz), 17)
            }
            ReservedRegion::TdInfoReserved => {
                field_range(TD_INFO_OFFSET + offset_of!(TdInfo, reserved_mbz), 64)
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReservedRegion::ReportMacReserved1 => "REPORTMACSTRUCT.RESERVED1",
            ReservedRegion::ReportMacReserved2 => "REPORTMACSTRUCT.RESERVED2",
            ReservedRegion::TdReportReserved => "TDREPORT.RESERVED",
            ReservedRegion::TdInfoReserved => "TDINFO.RESERVED",
        }
    }
}
