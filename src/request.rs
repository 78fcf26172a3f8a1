// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::tdx::REPORT_DATA_SIZE;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("user data is {len} bytes, a report request holds at most {max}")]
    InvalidInput { len: usize, max: usize },
}

/// The 64 bytes of caller data a TD report is bound to.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportRequest {
    #[serde(with = "BigArray")]
    report_data: [u8; REPORT_DATA_SIZE],
}

/// Build a report request from a user data prefix. The prefix is copied to
/// offset 0 and the remainder is zeroed.
pub fn build(user_data: &[u8]) -> Result<ReportRequest, RequestError> {
    if user_data.len() > REPORT_DATA_SIZE {
        return Err(RequestError::InvalidInput {
            len: user_data.len(),
            max: REPORT_DATA_SIZE,
        });
    }
    let mut report_data = [0u8; REPORT_DATA_SIZE];
    report_data[..user_data.len()].copy_from_slice(user_data);
    Ok(ReportRequest { report_data })
}

impl ReportRequest {
    pub fn new(user_data: &[u8]) -> Result<Self, RequestError> {
        build(user_data)
    }

    pub fn from_report_data(report_data: [u8; REPORT_DATA_SIZE]) -> Self {
        Self { report_data }
    }

    /// Bind a nonce of arbitrary length: its SHA256 digest fills the first 32
    /// bytes of the report data.
    pub fn sha256_of(nonce: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nonce);
        let digest: [u8; 32] = hasher.finalize().into();
        let mut report_data = [0u8; REPORT_DATA_SIZE];
        report_data[..digest.len()].copy_from_slice(&digest);
        Self { report_data }
    }

    pub fn report_data(&self) -> &[u8; REPORT_DATA_SIZE] {
        &self.report_data
    }
}
