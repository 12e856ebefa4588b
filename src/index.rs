use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::term::TermCursor;
use crate::utils::{nul_len, read_u32, read_u64};

pub use crate::postings::MAX_DOC_ID;

/// Byte size of one quantized embedding vector (signed 8-bit components).
pub const EMBEDDING_SIZE: usize = 512;

pub(crate) const GLOBAL_HEADER_SIZE: usize = 16;
pub(crate) const TERM_HEADER_SIZE: usize = 8;

pub(crate) const CONTENT_OFFSET_BITS: u32 = 36;
pub(crate) const EMBEDDINGS_OFFSET_BITS: u32 = 28;

pub(crate) const GBL_SUFFIX: &str = "_gbl";
pub(crate) const EMBEDDINGS_SUFFIX: &str = "_embeddings";
pub(crate) const CONTENT_SUFFIX: &str = "_content";
pub(crate) const TERM_IDX_SUFFIX: &str = "_term_idx";
pub(crate) const TERM_DATA_SUFFIX: &str = "_term_data";
pub(crate) const STATS_SUFFIX: &str = "_stats.txt";

pub(crate) fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Per-document header stored in the `_gbl` file. The two offsets share a
/// 64-bit little-endian word: content offset in bits 0..35, embeddings
/// offset (an embedding index, x512 for bytes) in bits 36..63.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalHeader {
    /// Term count for BM25.
    pub document_length: u32,
    /// Number of 512-byte embedding vectors.
    pub num_embeddings: u32,
    /// Byte offset into the content file (36 bits on disk).
    pub content_offset: u64,
    /// Embedding index into the embeddings file (28 bits on disk).
    pub embeddings_offset: u64,
}

impl GlobalHeader {
    pub(crate) fn read(data: &[u8], pos: usize) -> GlobalHeader {
        let word = read_u64(data, pos + 8);
        GlobalHeader {
            document_length: read_u32(data, pos),
            num_embeddings: read_u32(data, pos + 4),
            content_offset: word & ((1 << CONTENT_OFFSET_BITS) - 1),
            embeddings_offset: word >> CONTENT_OFFSET_BITS,
        }
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.document_length.to_le_bytes());
        out.extend_from_slice(&self.num_embeddings.to_le_bytes());
        let word = (self.content_offset & ((1 << CONTENT_OFFSET_BITS) - 1))
            | (self.embeddings_offset << CONTENT_OFFSET_BITS);
        out.extend_from_slice(&word.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TermHeader {
    pub max_positions: u32,
    pub document_frequency: u32,
}

impl TermHeader {
    pub(crate) fn read(data: &[u8], pos: usize) -> TermHeader {
        TermHeader {
            max_positions: read_u32(data, pos),
            document_frequency: read_u32(data, pos + 4),
        }
    }
}

/// Collection statistics written to `_stats.txt` on build and loaded with
/// the image.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct Stats {
    /// Number of distinct terms in the dictionary.
    pub total_terms: u64,
    /// Number of indexed documents.
    pub total_documents: u64,
    /// Sum of BM25 document lengths.
    pub total_terms_in_documents: u64,
    /// Largest doc id seen.
    pub max_id: u32,
}

impl Stats {
    /// Average BM25 document length; 0.0 for an empty index.
    pub fn average_document_length(&self) -> f64 {
        if self.total_documents > 0 {
            self.total_terms_in_documents as f64 / self.total_documents as f64
        } else {
            0.0
        }
    }

    fn parse(line: &str) -> Option<Stats> {
        let mut fields = line.split_whitespace();
        let stats = Stats {
            total_terms: fields.next()?.parse().ok()?,
            total_documents: fields.next()?.parse().ok()?,
            total_terms_in_documents: fields.next()?.parse().ok()?,
            max_id: fields.next()?.parse().ok()?,
        };
        Some(stats)
    }
}

/// Defines where the index resides during search: Ram (all files are read
/// into memory when opening the image) or Mmap (files are accessed via
/// memory-mapped IO).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum AccessType {
    /// Preload all index files into RAM.
    Ram,
    /// Access index files through memory maps.
    Mmap,
}

enum Blob {
    Ram(Vec<u8>),
    Mmap(Mmap),
}

impl Blob {
    fn load(path: &Path, access_type: &AccessType) -> Result<Blob, String> {
        match access_type {
            AccessType::Ram => fs::read(path)
                .map(Blob::Ram)
                .map_err(|e| format!("unable to read {}: {}", path.display(), e)),
            AccessType::Mmap => {
                let file = File::open(path)
                    .map_err(|e| format!("unable to open {}: {}", path.display(), e))?;
                let len = file
                    .metadata()
                    .map_err(|e| format!("unable to stat {}: {}", path.display(), e))?
                    .len();
                if len == 0 {
                    // zero-length maps are rejected by the OS
                    return Ok(Blob::Ram(Vec::new()));
                }
                let mmap = unsafe { Mmap::map(&file) }
                    .map_err(|e| format!("unable to mmap {}: {}", path.display(), e))?;
                Ok(Blob::Mmap(mmap))
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Blob::Ram(data) => data,
            Blob::Mmap(mmap) => mmap,
        }
    }
}

/// A loaded, immutable multi-document index.
///
/// Owns the five binary files (RAM or memory-mapped per [`AccessType`]),
/// a doc id lookup table over the global headers and the sorted term
/// dictionary backing `term` lookups. An image may be shared across
/// reader threads; every cursor borrows from it.
pub struct SearchImage {
    stats: Stats,
    average_document_length: f64,

    gbl_data: Blob,
    embedding_data: Blob,
    content_data: Blob,
    term_idx: Blob,
    term_data: Blob,

    // doc id -> offset of its record in gbl_data, u64::MAX when absent
    gbls: Vec<u64>,
    // offset of each dictionary entry in term_idx, sorted by term
    terms: Vec<usize>,
}

impl SearchImage {
    /// Load the six files of the index named `base`.
    pub fn open(base: &Path, access_type: AccessType) -> Result<SearchImage, String> {
        let stats_path = suffixed(base, STATS_SUFFIX);
        let stats_text = fs::read_to_string(&stats_path)
            .map_err(|e| format!("unable to read {}: {}", stats_path.display(), e))?;
        let stats = Stats::parse(stats_text.lines().next().unwrap_or(""))
            .ok_or_else(|| format!("malformed stats file {}", stats_path.display()))?;

        let gbl_data = Blob::load(&suffixed(base, GBL_SUFFIX), &access_type)?;
        let embedding_data = Blob::load(&suffixed(base, EMBEDDINGS_SUFFIX), &access_type)?;
        let content_data = Blob::load(&suffixed(base, CONTENT_SUFFIX), &access_type)?;
        let term_idx = Blob::load(&suffixed(base, TERM_IDX_SUFFIX), &access_type)?;
        let term_data = Blob::load(&suffixed(base, TERM_DATA_SUFFIX), &access_type)?;

        let mut gbls = vec![u64::MAX; stats.max_id as usize + 1];
        let data = gbl_data.bytes();
        let mut pos = 0;
        while pos < data.len() {
            let main_length = read_u32(data, pos) as usize;
            let id = read_u32(data, pos + 4 + GLOBAL_HEADER_SIZE) as usize;
            let slot = gbls
                .get_mut(id)
                .ok_or_else(|| format!("doc id {} out of range in global file", id))?;
            *slot = pos as u64;
            pos += 4 + main_length;
        }

        let idx_data = term_idx.bytes();
        let mut terms = Vec::new();
        let mut pos = 0;
        while pos < idx_data.len() {
            terms.push(pos);
            pos += nul_len(&idx_data[pos..]) + 1 + 8;
        }

        let average_document_length = stats.average_document_length();
        Ok(SearchImage {
            stats,
            average_document_length,
            gbl_data,
            embedding_data,
            content_data,
            term_idx,
            term_data,
            gbls,
            terms,
        })
    }

    /// Collection statistics of the loaded index.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of distinct terms in the dictionary.
    pub fn total_terms(&self) -> u64 {
        self.stats.total_terms
    }

    /// Number of indexed documents.
    pub fn total_documents(&self) -> u64 {
        self.stats.total_documents
    }

    /// Average BM25 document length.
    pub fn average_document_length(&self) -> f64 {
        self.average_document_length
    }

    /// One past the largest doc id (the size of the doc id lookup table).
    pub fn max_id_bound(&self) -> u32 {
        self.gbls.len() as u32
    }

    /// Global header and user data of a document, or None when the id was
    /// never indexed.
    pub fn global(&self, doc_id: u32) -> Option<(GlobalHeader, &[u8])> {
        let offset = *self.gbls.get(doc_id as usize)?;
        if offset == u64::MAX {
            return None;
        }
        let data = self.gbl_data.bytes();
        let pos = offset as usize;
        let main_length = read_u32(data, pos) as usize;
        let header = GlobalHeader::read(data, pos + 4);
        let user_data = &data[pos + 4 + GLOBAL_HEADER_SIZE..pos + 4 + main_length];
        Some((header, user_data))
    }

    /// Embedding block of a document.
    pub fn embeddings(&self, header: &GlobalHeader) -> &[i8] {
        let start = header.embeddings_offset as usize * EMBEDDING_SIZE;
        let len = header.num_embeddings as usize * EMBEDDING_SIZE;
        let bytes = &self.embedding_data.bytes()[start..start + len];
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i8, bytes.len()) }
    }

    /// Content bytes of a document.
    pub fn content(&self, header: &GlobalHeader) -> &[u8] {
        let data = self.content_data.bytes();
        let pos = header.content_offset as usize;
        let len = read_u32(data, pos) as usize;
        &data[pos + 4..pos + 4 + len]
    }

    fn term_entry(&self, term: &[u8]) -> Option<usize> {
        let idx_data = self.term_idx.bytes();
        self.terms
            .binary_search_by(|&offset| {
                let entry = &idx_data[offset..offset + nul_len(&idx_data[offset..])];
                entry.cmp(term)
            })
            .ok()
            .map(|i| self.terms[i])
    }

    /// Look up a term and build a cursor over its posting list. A miss
    /// with a trailing `*` retries without the star.
    pub fn term(&self, term: &[u8]) -> Option<TermCursor<'_>> {
        let entry = match self.term_entry(term) {
            Some(entry) => Some(entry),
            None if term.last() == Some(&b'*') => self.term_entry(&term[..term.len() - 1]),
            None => None,
        }?;
        let idx_data = self.term_idx.bytes();
        let term_len = nul_len(&idx_data[entry..]);
        let offset = read_u64(idx_data, entry + term_len + 1) as usize;

        let data = self.term_data.bytes();
        let payload_length = read_u32(data, offset - 4) as usize;
        let header = TermHeader::read(data, offset);
        let blob = &data[offset + TERM_HEADER_SIZE..offset + payload_length];
        Some(TermCursor::from_hierarchical(
            blob,
            header.max_positions,
            header.document_frequency,
        ))
    }

    /// All dictionary terms in sorted order.
    pub fn terms(&self) -> Vec<&[u8]> {
        let idx_data = self.term_idx.bytes();
        self.terms
            .iter()
            .map(|&offset| &idx_data[offset..offset + nul_len(&idx_data[offset..])])
            .collect()
    }
}
