//! The snapshot format.
//!
//! One little-endian file:
//!
//! ```text
//! magic "USEARCH\0" | version u32 | dims u32 | element u32 | metric u32
//! M u32 | M0 u32 | ef_construction u32 | ef_search u32
//! size u64 | capacity u64 | entry u32 (0xFFFFFFFF if empty) | max_level u32
//! level_lambda f64
//! per node, id = 0..size: label i64, top_layer u32,
//!                         per layer 0..=top_layer { count u32, ids u32×count }
//! zero padding to a 64-byte boundary
//! vector arena: size × stride raw bytes
//! ```
//!
//! The magic string, version and enum codes are a stable contract. `load`
//! materializes everything into owned memory; `view` keeps the mapping and
//! serves node lists and vectors from it in place.

use crate::node::{LinkLists, LinkParams, Node, NodeId, INVALID_NODE, MAX_LEVEL};
use crate::{CoreState, Index};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use proxima_core::{Error, IndexOptions, Kernel, MetricKind, Result, ScalarKind};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

pub(crate) const MAGIC: &[u8; 8] = b"USEARCH\0";
pub(crate) const VERSION: u32 = 1;
const HEADER_LEN: usize = 72;
const ARENA_ALIGN: u64 = 64;

#[inline]
fn align_up(offset: u64) -> u64 {
    (offset + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

struct Header {
    dims: u32,
    element: u32,
    metric: u32,
    m: u32,
    m0: u32,
    expansion_add: u32,
    expansion_search: u32,
    size: u64,
    capacity: u64,
    entry: u32,
    max_level: u32,
    level_lambda: f64,
}

impl Header {
    fn read(input: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::IncompatibleFile("bad magic string".into()));
        }
        let version = input.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(Error::IncompatibleFile(format!(
                "file version {version}, engine speaks {VERSION}"
            )));
        }
        let header = Self {
            dims: input.read_u32::<LittleEndian>()?,
            element: input.read_u32::<LittleEndian>()?,
            metric: input.read_u32::<LittleEndian>()?,
            m: input.read_u32::<LittleEndian>()?,
            m0: input.read_u32::<LittleEndian>()?,
            expansion_add: input.read_u32::<LittleEndian>()?,
            expansion_search: input.read_u32::<LittleEndian>()?,
            size: input.read_u64::<LittleEndian>()?,
            capacity: input.read_u64::<LittleEndian>()?,
            entry: input.read_u32::<LittleEndian>()?,
            max_level: input.read_u32::<LittleEndian>()?,
            level_lambda: input.read_f64::<LittleEndian>()?,
        };
        header.sanity()?;
        Ok(header)
    }

    fn sanity(&self) -> Result<()> {
        if self.m < 2 || self.m0 < self.m {
            return Err(Error::IncompatibleFile(format!(
                "connectivity {}/{} is malformed",
                self.m, self.m0
            )));
        }
        if self.capacity < self.size {
            return Err(Error::IncompatibleFile(format!(
                "capacity {} below size {}",
                self.capacity, self.size
            )));
        }
        if self.max_level as usize > MAX_LEVEL {
            return Err(Error::IncompatibleFile(format!(
                "max level {} above the engine cap {MAX_LEVEL}",
                self.max_level
            )));
        }
        if self.size > 0 && u64::from(self.entry) >= self.size {
            return Err(Error::IncompatibleFile(format!(
                "entry id {} is not a live node",
                self.entry
            )));
        }
        if self.size == 0 && self.entry != INVALID_NODE {
            return Err(Error::IncompatibleFile(
                "empty index carries an entry point".into(),
            ));
        }
        Ok(())
    }

    /// The geometry/metric checks that make a file loadable into this index.
    fn check_compatible(&self, options: &IndexOptions, kernel: &Kernel) -> Result<()> {
        if self.dims as usize != options.dimensions {
            return Err(Error::IncompatibleFile(format!(
                "file holds {}-dimensional vectors, index expects {}",
                self.dims, options.dimensions
            )));
        }
        let element = ScalarKind::from_code(self.element)
            .ok_or_else(|| Error::IncompatibleFile(format!("unknown element code {}", self.element)))?;
        if element != options.scalar {
            return Err(Error::IncompatibleFile(format!(
                "file element kind {element:?}, index expects {:?}",
                options.scalar
            )));
        }
        let metric = MetricKind::from_code(self.metric)
            .ok_or_else(|| Error::IncompatibleFile(format!("unknown metric code {}", self.metric)))?;
        if metric != kernel.metric().kind() {
            return Err(Error::IncompatibleFile(format!(
                "file metric {metric:?}, index runs {:?}",
                kernel.metric().kind()
            )));
        }
        Ok(())
    }

    fn params(&self) -> LinkParams {
        LinkParams { m: self.m as usize, m0: self.m0 as usize }
    }
}

/// Replacement state produced by `load`/`view`.
pub(crate) struct Loaded {
    pub params: LinkParams,
    pub level_lambda: f64,
    pub size: u32,
    pub entry: u32,
    pub max_level: u32,
    pub expansion_add: u32,
    pub expansion_search: u32,
    pub nodes: Vec<Node>,
    pub vectors: proxima_store::VectorStore,
    pub mapped: Option<MappedGraph>,
}

/// Read-only graph topology served from a mapping.
pub(crate) struct MappedGraph {
    map: Arc<Mmap>,
    pub(crate) refs: Vec<MappedNode>,
}

pub(crate) struct MappedNode {
    pub label: i64,
    pub top_layer: u32,
    /// Absolute offset of this node's first `{count, ids}` layer record.
    links_at: usize,
}

impl MappedGraph {
    pub(crate) fn links_into(&self, id: NodeId, layer: usize, out: &mut Vec<NodeId>) {
        let node = &self.refs[id as usize];
        if layer > node.top_layer as usize {
            return;
        }
        let mut at = node.links_at;
        for _ in 0..layer {
            let count = read_u32_at(&self.map, at) as usize;
            at += 4 + 4 * count;
        }
        let count = read_u32_at(&self.map, at) as usize;
        at += 4;
        out.reserve(count);
        for slot in 0..count {
            out.push(read_u32_at(&self.map, at + 4 * slot));
        }
    }
}

#[inline]
fn read_u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn read_i64_at(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

pub(crate) fn save(
    index: &Index,
    state: &CoreState,
    size: u32,
    entry: u64,
    path: &Path,
) -> Result<()> {
    let params = state.params;
    let mut out = BufWriter::new(File::create(path)?);

    out.write_all(MAGIC)?;
    out.write_u32::<LittleEndian>(VERSION)?;
    out.write_u32::<LittleEndian>(index.dimensions() as u32)?;
    out.write_u32::<LittleEndian>(index.scalar().code())?;
    out.write_u32::<LittleEndian>(index.metric_kind().code())?;
    out.write_u32::<LittleEndian>(params.m as u32)?;
    out.write_u32::<LittleEndian>(params.m0 as u32)?;
    out.write_u32::<LittleEndian>(index.expansion_add() as u32)?;
    out.write_u32::<LittleEndian>(index.expansion_search() as u32)?;
    out.write_u64::<LittleEndian>(u64::from(size))?;
    out.write_u64::<LittleEndian>(state.vectors.capacity() as u64)?;
    out.write_u32::<LittleEndian>(crate::entry_id(entry))?;
    out.write_u32::<LittleEndian>(crate::entry_level(entry))?;
    out.write_f64::<LittleEndian>(state.level_lambda)?;

    let mut position = HEADER_LEN as u64;
    let mut list = Vec::new();
    for id in 0..size {
        let top_layer = state.top_layer(id);
        out.write_i64::<LittleEndian>(state.label(id))?;
        out.write_u32::<LittleEndian>(top_layer as u32)?;
        position += 12;
        for layer in 0..=top_layer {
            state.links_into(id, layer, &mut list);
            out.write_u32::<LittleEndian>(list.len() as u32)?;
            for &neighbor in &list {
                out.write_u32::<LittleEndian>(neighbor)?;
            }
            position += 4 + 4 * list.len() as u64;
        }
    }

    let padding = align_up(position) - position;
    out.write_all(&vec![0u8; padding as usize])?;

    state.vectors.copy_out(size as usize, &mut out)?;
    out.flush()?;
    Ok(())
}

pub(crate) fn load(path: &Path, options: &IndexOptions, kernel: &Kernel) -> Result<Loaded> {
    let mut input = BufReader::new(File::open(path)?);
    let header = Header::read(&mut input)?;
    header.check_compatible(options, kernel)?;
    let params = header.params();
    let capacity = header.capacity as usize;
    let size = header.size as u32;

    let mut nodes = Vec::new();
    nodes.resize_with(capacity, Node::empty);
    let mut position = HEADER_LEN as u64;
    let mut list: Vec<NodeId> = Vec::new();
    for id in 0..size {
        let label = input.read_i64::<LittleEndian>()?;
        let top_layer = input.read_u32::<LittleEndian>()? as usize;
        if top_layer > MAX_LEVEL {
            return Err(Error::IncompatibleFile(format!(
                "node {id} claims top layer {top_layer}"
            )));
        }
        position += 12;
        let mut links = LinkLists::new(top_layer, params);
        for layer in 0..=top_layer {
            let count = input.read_u32::<LittleEndian>()? as usize;
            if count > params.cap(layer) {
                return Err(Error::IncompatibleFile(format!(
                    "node {id} holds {count} neighbors at layer {layer}, cap is {}",
                    params.cap(layer)
                )));
            }
            list.clear();
            for _ in 0..count {
                let neighbor = input.read_u32::<LittleEndian>()?;
                if u64::from(neighbor) >= header.size {
                    return Err(Error::IncompatibleFile(format!(
                        "node {id} links to non-live node {neighbor}"
                    )));
                }
                list.push(neighbor);
            }
            links.set_layer(layer, params, &list);
            position += 4 + 4 * count as u64;
        }
        let slot = nodes[id as usize].slot.get_mut();
        slot.label = label;
        slot.links = Some(links);
    }

    let padding = (align_up(position) - position) as usize;
    let mut scrap = [0u8; ARENA_ALIGN as usize];
    input.read_exact(&mut scrap[..padding])?;

    let mut vectors = proxima_store::VectorStore::new(kernel.payload());
    vectors.reserve(capacity)?;
    vectors.fill_from(size as usize, &mut input)?;

    Ok(Loaded {
        params,
        level_lambda: header.level_lambda,
        size,
        entry: header.entry,
        max_level: header.max_level,
        expansion_add: header.expansion_add,
        expansion_search: header.expansion_search,
        nodes,
        vectors,
        mapped: None,
    })
}

pub(crate) fn view(path: &Path, options: &IndexOptions, kernel: &Kernel) -> Result<Loaded> {
    let file = File::open(path)?;
    // Safety: the mapping is read-only; the documented caller contract is
    // that nobody truncates the snapshot while it is being served.
    let map = Arc::new(unsafe { Mmap::map(&file)? });

    let mut cursor = Cursor::new(&map[..]);
    let header = Header::read(&mut cursor)?;
    header.check_compatible(options, kernel)?;
    let params = header.params();
    let size = header.size as u32;

    let mut refs = Vec::with_capacity(size as usize);
    let mut at = HEADER_LEN;
    for id in 0..size {
        if at + 12 > map.len() {
            return Err(Error::IncompatibleFile(format!(
                "file truncated inside node {id}"
            )));
        }
        let label = read_i64_at(&map, at);
        let top_layer = read_u32_at(&map, at + 8);
        if top_layer as usize > MAX_LEVEL {
            return Err(Error::IncompatibleFile(format!(
                "node {id} claims top layer {top_layer}"
            )));
        }
        at += 12;
        let links_at = at;
        for layer in 0..=top_layer as usize {
            if at + 4 > map.len() {
                return Err(Error::IncompatibleFile(format!(
                    "file truncated inside node {id}"
                )));
            }
            let count = read_u32_at(&map, at) as usize;
            if count > params.cap(layer) {
                return Err(Error::IncompatibleFile(format!(
                    "node {id} holds {count} neighbors at layer {layer}, cap is {}",
                    params.cap(layer)
                )));
            }
            if at + 4 + 4 * count > map.len() {
                return Err(Error::IncompatibleFile(format!(
                    "file truncated inside node {id}"
                )));
            }
            for slot in 0..count {
                let neighbor = read_u32_at(&map, at + 4 + 4 * slot);
                if u64::from(neighbor) >= header.size {
                    return Err(Error::IncompatibleFile(format!(
                        "node {id} links to non-live node {neighbor}"
                    )));
                }
            }
            at += 4 + 4 * count;
        }
        if at > map.len() {
            return Err(Error::IncompatibleFile(format!(
                "file truncated inside node {id}"
            )));
        }
        refs.push(MappedNode { label, top_layer, links_at });
    }

    let arena_at = align_up(at as u64) as usize;
    let vectors =
        proxima_store::VectorStore::mapped(map.clone(), arena_at, kernel.payload(), size as usize)?;

    Ok(Loaded {
        params,
        level_lambda: header.level_lambda,
        size,
        entry: header.entry,
        max_level: header.max_level,
        expansion_add: header.expansion_add,
        expansion_search: header.expansion_search,
        nodes: Vec::new(),
        vectors,
        mapped: Some(MappedGraph { map, refs }),
    })
}
