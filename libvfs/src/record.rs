//! Persisted form of inodes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::extension::Extensions;
use crate::inode::{
    Attributes, ChildEntry, DirectoryData, DirectoryState, FileData, FileState, Inode, InodeKind,
    LinkData,
};
use crate::path::CiName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonRecord {
    pub username: String,
    pub group: String,
    pub last_modified: i64,
    pub creation_time: i64,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub size: u64,
    #[serde(default)]
    pub ref_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    #[serde(flatten)]
    pub common: CommonRecord,
    pub size: u64,
    #[serde(default)]
    pub slave_ref_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub placeholder_last_modified: bool,
    #[serde(default)]
    pub children: BTreeMap<String, ChildSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub common: CommonRecord,
    pub size: u64,
    #[serde(default)]
    pub slaves: BTreeSet<String>,
    #[serde(default)]
    pub checksum: u64,
    #[serde(default)]
    pub xfertime: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    #[serde(flatten)]
    pub common: CommonRecord,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InodeRecord {
    Directory(DirectoryRecord),
    File(FileRecord),
    Link(LinkRecord),
}

impl InodeRecord {
    pub fn common(&self) -> &CommonRecord {
        match self {
            InodeRecord::Directory(d) => &d.common,
            InodeRecord::File(f) => &f.common,
            InodeRecord::Link(l) => &l.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonRecord {
        match self {
            InodeRecord::Directory(d) => &mut d.common,
            InodeRecord::File(f) => &mut f.common,
            InodeRecord::Link(l) => &mut l.common,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, InodeRecord::Directory(_))
    }
}

impl From<Attributes> for CommonRecord {
    fn from(a: Attributes) -> Self {
        CommonRecord {
            username: a.username,
            group: a.group,
            last_modified: a.last_modified,
            creation_time: a.creation_time,
            extensions: a.extensions,
        }
    }
}

impl From<CommonRecord> for Attributes {
    fn from(c: CommonRecord) -> Self {
        Attributes {
            username: c.username,
            group: c.group,
            last_modified: c.last_modified,
            creation_time: c.creation_time,
            extensions: c.extensions,
        }
    }
}

impl Inode {
    /// Snapshot of this inode in persisted form.
    pub fn to_record(&self) -> InodeRecord {
        let common = CommonRecord::from(self.attributes());
        match self.kind() {
            InodeKind::Directory(d) => {
                let state = d.state();
                InodeRecord::Directory(DirectoryRecord {
                    common,
                    size: state.size,
                    slave_ref_counts: state.ref_counts.clone(),
                    placeholder_last_modified: state.placeholder_last_modified,
                    children: state
                        .children
                        .iter()
                        .map(|(name, entry)| {
                            (
                                name.as_str().to_string(),
                                ChildSummary {
                                    size: entry.size,
                                    ref_counts: entry.ref_counts.clone(),
                                },
                            )
                        })
                        .collect(),
                })
            }
            InodeKind::File(f) => {
                let state = f.state();
                InodeRecord::File(FileRecord {
                    common,
                    size: state.size,
                    slaves: state.slaves.clone(),
                    checksum: state.checksum,
                    xfertime: state.xfertime,
                })
            }
            InodeKind::Link(l) => InodeRecord::Link(LinkRecord {
                common,
                target: l.target(),
            }),
        }
    }

    /// Builds an unattached inode from a record. For directories the child
    /// map is seeded from `children`, which the caller has already
    /// reconciled against the physical layout.
    pub(crate) fn from_record(
        name: &str,
        record: InodeRecord,
        children: BTreeMap<String, ChildSummary>,
    ) -> std::sync::Arc<Inode> {
        match record {
            InodeRecord::Directory(d) => {
                let mut state = DirectoryState {
                    children: children
                        .into_iter()
                        .map(|(n, s)| {
                            (
                                CiName::new(n),
                                ChildEntry {
                                    cached: None,
                                    size: s.size,
                                    ref_counts: s.ref_counts,
                                },
                            )
                        })
                        .collect(),
                    size: d.size,
                    ref_counts: d.slave_ref_counts,
                    placeholder_last_modified: d.placeholder_last_modified,
                };
                state.recompute();
                Inode::new(
                    name,
                    d.common.into(),
                    InodeKind::Directory(DirectoryData::new(state)),
                )
            }
            InodeRecord::File(f) => Inode::new(
                name,
                f.common.into(),
                InodeKind::File(FileData::new(FileState {
                    slaves: f.slaves,
                    size: f.size,
                    checksum: f.checksum,
                    xfertime: f.xfertime,
                })),
            ),
            InodeRecord::Link(l) => Inode::new(
                name,
                l.common.into(),
                InodeKind::Link(LinkData::new(&l.target)),
            ),
        }
    }
}
