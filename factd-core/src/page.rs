//! Paged, copy-on-write sorted indexes.
//!
//! Layout:
//! ```text
//! address 0 ─ RootPage { schema, counters, eavt: [LeafRef], aevt: [..], avet: [..] }
//!                                   │
//!              ┌────────────────────┼────────────────────┐
//!              ▼                    ▼                    ▼
//!         leaf @ 17            leaf @ 18            leaf @ 42
//!      [datom; ≤512]         [datom; ≤512]        [datom; ≤512]
//! ```
//!
//! Leaves are immutable once stored. Changing a leaf writes a replacement
//! under a fresh address and a new directory; the root page is rewritten
//! last, so a failed write leaves the previous root fully intact.
//!
//! Pages are bincode-encoded and LZ4-compressed, the same codec the sidecar
//! uses on the wire.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::datom::{Components, Datom, IndexKind};
use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use crate::storage::{Address, PageStorage, StorageError};
use crate::value::{EntityId, TxId};

/// Maximum datoms per leaf before it splits.
pub const LEAF_CAPACITY: usize = 512;

/// Root page format version.
pub const ROOT_FORMAT: u16 = 1;

const LEAF_TAG: u8 = 1;
const ROOT_TAG: u8 = 2;

/// Directory entry for one leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafRef {
    pub first: Datom,
    pub address: Address,
    pub len: u32,
}

/// Everything needed to reopen a fact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootPage {
    pub format: u16,
    pub schema: Schema,
    pub eavt: Vec<LeafRef>,
    pub aevt: Vec<LeafRef>,
    pub avet: Vec<LeafRef>,
    pub max_eid: EntityId,
    pub max_tx: TxId,
    pub next_address: Address,
}

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn encode_tagged<T: Serialize + ?Sized>(tag: u8, body: &T) -> CoreResult<Vec<u8>> {
    let mut raw = bincode::serde::encode_to_vec(tag, codec())
        .map_err(|e| StorageError::Io(format!("page encode failed: {e}")))?;
    let body = bincode::serde::encode_to_vec(body, codec())
        .map_err(|e| StorageError::Io(format!("page encode failed: {e}")))?;
    raw.extend_from_slice(&body);
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_tagged<T: for<'de> Deserialize<'de>>(
    address: Address,
    expected: u8,
    bytes: &[u8],
) -> Result<T, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt { address, reason };
    let raw = lz4_flex::decompress_size_prepended(bytes).map_err(|e| corrupt(e.to_string()))?;
    let (tag, used): (u8, usize) =
        bincode::serde::decode_from_slice(&raw, codec()).map_err(|e| corrupt(e.to_string()))?;
    if tag != expected {
        return Err(corrupt(format!("expected page tag {expected}, found {tag}")));
    }
    let (body, _) =
        bincode::serde::decode_from_slice(&raw[used..], codec()).map_err(|e| corrupt(e.to_string()))?;
    Ok(body)
}

pub fn encode_leaf(datoms: &[Datom]) -> CoreResult<Vec<u8>> {
    encode_tagged(LEAF_TAG, datoms)
}

pub fn decode_leaf(address: Address, bytes: &[u8]) -> Result<Vec<Datom>, StorageError> {
    decode_tagged(address, LEAF_TAG, bytes)
}

pub fn encode_root(root: &RootPage) -> CoreResult<Vec<u8>> {
    encode_tagged(ROOT_TAG, root)
}

pub fn decode_root(address: Address, bytes: &[u8]) -> Result<RootPage, StorageError> {
    let root: RootPage = decode_tagged(address, ROOT_TAG, bytes)?;
    if root.format != ROOT_FORMAT {
        return Err(StorageError::Corrupt {
            address,
            reason: format!("unsupported root format {}", root.format),
        });
    }
    Ok(root)
}

/// One sorted index, split into leaf pages.
#[derive(Debug, Clone)]
pub struct PagedIndex {
    kind: IndexKind,
    leaves: Arc<Vec<LeafRef>>,
}

impl PagedIndex {
    pub fn empty(kind: IndexKind) -> Self {
        Self {
            kind,
            leaves: Arc::new(Vec::new()),
        }
    }

    pub fn from_refs(kind: IndexKind, refs: Vec<LeafRef>) -> Self {
        Self {
            kind,
            leaves: Arc::new(refs),
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn refs(&self) -> &[LeafRef] {
        &self.leaves
    }

    /// Number of datoms across all leaves.
    pub fn len(&self) -> usize {
        self.leaves.iter().map(|l| l.len as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.leaves.iter().map(|l| l.address)
    }

    fn load_leaf(storage: &dyn PageStorage, leaf: &LeafRef) -> CoreResult<Vec<Datom>> {
        let bytes = storage.restore(leaf.address)?;
        Ok(decode_leaf(leaf.address, &bytes)?)
    }

    /// All datoms matching `comps`, in index order.
    ///
    /// The contiguous bound prefix narrows the leaves visited; remaining
    /// bound components filter.
    pub fn scan(&self, storage: &dyn PageStorage, comps: &Components) -> CoreResult<Vec<Datom>> {
        let kind = self.kind;
        let start = self
            .leaves
            .partition_point(|l| comps.cmp_prefix(kind, &l.first) == Ordering::Less)
            .saturating_sub(1);

        let mut out = Vec::new();
        for leaf in &self.leaves[start..] {
            if comps.cmp_prefix(kind, &leaf.first) == Ordering::Greater {
                break;
            }
            for d in Self::load_leaf(storage, leaf)? {
                match comps.cmp_prefix(kind, &d) {
                    Ordering::Less => continue,
                    Ordering::Equal => {
                        if comps.matches(&d) {
                            out.push(d);
                        }
                    }
                    Ordering::Greater => return Ok(out),
                }
            }
        }
        Ok(out)
    }

    /// Apply inserts and removes copy-on-write.
    ///
    /// Returns the new index and the addresses of leaves it no longer
    /// references. New leaves are stored before this returns; nothing is
    /// deleted.
    pub fn apply(
        &self,
        storage: &dyn PageStorage,
        next_address: &mut Address,
        inserts: &[Datom],
        removes: &[Datom],
    ) -> CoreResult<(PagedIndex, Vec<Address>)> {
        let kind = self.kind;
        if inserts.is_empty() && removes.is_empty() {
            return Ok((self.clone(), Vec::new()));
        }

        if self.leaves.is_empty() {
            let mut datoms = inserts.to_vec();
            datoms.sort_by(|a, b| kind.cmp(a, b));
            datoms.dedup_by(|a, b| kind.cmp(a, b) == Ordering::Equal);
            let refs = write_leaves(storage, next_address, datoms)?;
            return Ok((Self::from_refs(kind, refs), Vec::new()));
        }

        let locate = |d: &Datom| {
            self.leaves
                .partition_point(|l| kind.cmp(&l.first, d) != Ordering::Greater)
                .saturating_sub(1)
        };

        let mut groups: BTreeMap<usize, (Vec<&Datom>, Vec<&Datom>)> = BTreeMap::new();
        for d in inserts {
            groups.entry(locate(d)).or_default().0.push(d);
        }
        for d in removes {
            groups.entry(locate(d)).or_default().1.push(d);
        }

        let mut refs = Vec::with_capacity(self.leaves.len() + groups.len());
        let mut superseded = Vec::new();
        for (i, leaf) in self.leaves.iter().enumerate() {
            let Some((ins, rem)) = groups.remove(&i) else {
                refs.push(leaf.clone());
                continue;
            };
            let mut datoms = Self::load_leaf(storage, leaf)?;
            for d in rem {
                if let Ok(pos) = datoms.binary_search_by(|x| kind.cmp(x, d)) {
                    datoms.remove(pos);
                }
            }
            for d in ins {
                match datoms.binary_search_by(|x| kind.cmp(x, d)) {
                    Ok(pos) => datoms[pos] = d.clone(),
                    Err(pos) => datoms.insert(pos, d.clone()),
                }
            }
            superseded.push(leaf.address);
            if !datoms.is_empty() {
                refs.extend(write_leaves(storage, next_address, datoms)?);
            }
        }

        Ok((Self::from_refs(kind, refs), superseded))
    }
}

/// Store sorted datoms as one leaf, or as half-full leaves when they
/// overflow a single page.
fn write_leaves(
    storage: &dyn PageStorage,
    next_address: &mut Address,
    datoms: Vec<Datom>,
) -> CoreResult<Vec<LeafRef>> {
    let chunk = if datoms.len() <= LEAF_CAPACITY {
        datoms.len().max(1)
    } else {
        LEAF_CAPACITY / 2
    };
    let mut refs = Vec::with_capacity(datoms.len() / chunk + 1);
    for part in datoms.chunks(chunk) {
        let address = *next_address;
        *next_address += 1;
        storage.store(address, encode_leaf(part)?)?;
        refs.push(LeafRef {
            first: part[0].clone(),
            address,
            len: part.len() as u32,
        });
    }
    Ok(refs)
}
