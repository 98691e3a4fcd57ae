use serde::{Deserialize, Serialize};

/// Space report of one slave, across all of its roots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStatus {
    pub space_available: u64,
    pub space_capacity: u64,
}

impl DiskStatus {
    pub fn space_used(&self) -> u64 {
        self.space_capacity.saturating_sub(self.space_available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// The slave receives bytes from a client.
    Upload,
    /// The slave sends bytes to a client.
    Download,
}

/// Progress report the slave sends for one running transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub transfer: u64,
    pub path: String,
    pub direction: TransferDirection,
    pub transferred: u64,
    /// Bytes per second over the last sample.
    pub speed: u64,
    pub finished: bool,
}

/// Disk space and transfer load of one slave, or of several summed up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlaveStatus {
    pub disk: DiskStatus,
    pub throughput_up: u64,
    pub throughput_down: u64,
    pub transfers_up: usize,
    pub transfers_down: usize,
}

impl SlaveStatus {
    pub fn append(self, other: SlaveStatus) -> SlaveStatus {
        SlaveStatus {
            disk: DiskStatus {
                space_available: self.disk.space_available + other.disk.space_available,
                space_capacity: self.disk.space_capacity + other.disk.space_capacity,
            },
            throughput_up: self.throughput_up + other.throughput_up,
            throughput_down: self.throughput_down + other.throughput_down,
            transfers_up: self.transfers_up + other.transfers_up,
            transfers_down: self.transfers_down + other.transfers_down,
        }
    }

    pub fn throughput(&self) -> u64 {
        self.throughput_up + self.throughput_down
    }

    pub fn transfers(&self) -> usize {
        self.transfers_up + self.transfers_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_sums_everything() {
        let a = SlaveStatus {
            disk: DiskStatus {
                space_available: 10,
                space_capacity: 100,
            },
            throughput_up: 5,
            throughput_down: 1,
            transfers_up: 2,
            transfers_down: 0,
        };
        let b = SlaveStatus {
            disk: DiskStatus {
                space_available: 30,
                space_capacity: 50,
            },
            throughput_up: 0,
            throughput_down: 4,
            transfers_up: 0,
            transfers_down: 3,
        };
        let all = SlaveStatus::default().append(a).append(b);
        assert_eq!(all.disk.space_available, 40);
        assert_eq!(all.disk.space_used(), 110);
        assert_eq!(all.throughput(), 10);
        assert_eq!(all.transfers(), 5);
    }
}
