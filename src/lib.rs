pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod proxmox;
pub mod storage;
pub mod util;
pub mod wal;

use serde::{Deserialize, Serialize};

/// Identifier of a monitored guest (Proxmox `vmid`)
pub type EntityId = i64;

/// One resource-usage measurement of a guest at one point in time
///
/// Field names follow the Proxmox `rrddata` payload. A missing gauge means the
/// guest was offline (or the value unknown) at `time`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in seconds
    pub time: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, rename = "maxcpu", skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<f64>,
    #[serde(default, rename = "maxmem", skip_serializing_if = "Option::is_none")]
    pub max_mem: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    #[serde(default, rename = "maxdisk", skip_serializing_if = "Option::is_none")]
    pub max_disk: Option<f64>,

    #[serde(default, rename = "netin", skip_serializing_if = "Option::is_none")]
    pub net_in: Option<f64>,
    #[serde(default, rename = "netout", skip_serializing_if = "Option::is_none")]
    pub net_out: Option<f64>,

    #[serde(default, rename = "diskread", skip_serializing_if = "Option::is_none")]
    pub disk_read: Option<f64>,
    #[serde(default, rename = "diskwrite", skip_serializing_if = "Option::is_none")]
    pub disk_write: Option<f64>,
}

impl Sample {
    /// Create a sample without any gauges
    pub fn at(time: i64) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }

    /// A guest counts as online when the CPU gauge was reported
    pub fn is_online(&self) -> bool {
        self.cpu.is_some()
    }
}

/// A sample tagged with its guest id
///
/// This is the line format of the write-ahead buffer and the payload format
/// accepted on the raw ingest topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub vmid: EntityId,

    #[serde(flatten)]
    pub sample: Sample,
}

impl BufferedRecord {
    pub fn new(vmid: EntityId, sample: Sample) -> Self {
        Self { vmid, sample }
    }
}
