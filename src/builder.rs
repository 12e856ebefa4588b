use num_format::{Locale, ToFormattedString};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::index::{
    CONTENT_OFFSET_BITS, CONTENT_SUFFIX, EMBEDDING_SIZE, EMBEDDINGS_OFFSET_BITS, EMBEDDINGS_SUFFIX,
    GBL_SUFFIX, GLOBAL_HEADER_SIZE, GlobalHeader, STATS_SUFFIX, Stats, TERM_DATA_SUFFIX,
    TERM_HEADER_SIZE, TERM_IDX_SUFFIX, suffixed,
};
use crate::postings::{
    CONTROL_ID_SHIFT, GROUP_MASK, MAX_DOC_ID, MID_GROUP_MASK, MID_GROUP_SHIFT, Occurrence,
    SMALL_ID_MASK, TOP_GROUP_MASK, TOP_GROUP_SHIFT, encode_group, encode_record,
};
use crate::sort::ExternalSorter;
use crate::utils::{read_u32, write_u32};

// Sort record layouts fed to the external sorter.
// term record:   [doc id u32][position u32][value u32][term bytes]
// global record: [global header][user data][embeddings][content len u32][content]
const TERM_RECORD_HEAD: usize = 12;

fn compare_term_records(a: &[u8], b: &[u8]) -> Ordering {
    a[TERM_RECORD_HEAD..]
        .cmp(&b[TERM_RECORD_HEAD..])
        .then_with(|| read_u32(a, 0).cmp(&read_u32(b, 0)))
        .then_with(|| read_u32(a, 4).cmp(&read_u32(b, 4)))
}

fn compare_global_records(a: &[u8], b: &[u8]) -> Ordering {
    // the doc id is the first 4 bytes of the user data, right after the header
    read_u32(a, GLOBAL_HEADER_SIZE).cmp(&read_u32(b, GLOBAL_HEADER_SIZE))
}

// The wildcard-expansion hook, disabled as in the document builder.
fn valid_expansion_term(_term: &[u8]) -> bool {
    false
}

#[derive(Clone, Copy)]
struct TermRecord {
    id: u32,
    position: u32,
    value: u32,
}

#[derive(Default)]
struct GroupBuffers {
    top: Vec<u8>,
    mid: Vec<u8>,
    group: Vec<u8>,
    tmp: Vec<u8>,
    occurrences: Vec<Occurrence>,
}

/// Builds a multi-document index and writes the six `<base>_*` files.
///
/// Call order per document: `global` (starting the document, its doc id
/// read from the first 4 bytes of the user data), then the term
/// operations. `finish` drains the external sorts and emits the files.
/// Incoming records are spooled to two external sorters, so memory usage
/// is bounded by `buffer_size` regardless of collection size.
pub struct IndexWriter {
    base: PathBuf,
    term_sorter: ExternalSorter,
    global_sorter: ExternalSorter,
    global_record: Vec<u8>,
    record_scratch: Vec<u8>,
    current_id: u32,
    document_length: u32,
    max_id: u32,
    total_documents: u64,
    total_terms: u64,
    mute: bool,
}

impl IndexWriter {
    /// Create a writer for the index named `base`. `buffer_size` bounds
    /// the in-memory buffer of the term sorter (the global sorter gets a
    /// tenth of it); `mute` suppresses the progress output of `finish`.
    pub fn new(base: &Path, buffer_size: usize, mute: bool) -> IndexWriter {
        IndexWriter {
            term_sorter: ExternalSorter::new(
                suffixed(base, "_terms.sort"),
                buffer_size,
                compare_term_records,
            ),
            global_sorter: ExternalSorter::new(
                suffixed(base, "_gbl.sort"),
                buffer_size / 10,
                compare_global_records,
            ),
            base: base.to_path_buf(),
            global_record: Vec::new(),
            record_scratch: Vec::new(),
            current_id: 0,
            document_length: 0,
            max_id: 0,
            total_documents: 0,
            total_terms: 0,
            mute,
        }
    }

    fn push(&mut self, value: u32, position: u32, term: &[u8]) {
        self.record_scratch.clear();
        self.record_scratch
            .extend_from_slice(&self.current_id.to_le_bytes());
        self.record_scratch.extend_from_slice(&position.to_le_bytes());
        self.record_scratch.extend_from_slice(&value.to_le_bytes());
        for &b in term {
            self.record_scratch.push(b.to_ascii_lowercase());
        }
        self.term_sorter.push(self.record_scratch.clone());
    }

    /// Add a document-level term (no position, no value).
    pub fn term(&mut self, term: &[u8]) {
        self.push(0, 0, term);
    }

    /// Add a term occurrence at token position `pos`; counts towards the
    /// BM25 document length.
    pub fn term_position(&mut self, pos: u32, term: &[u8]) {
        self.document_length += 1;
        self.push(0, pos, term);
    }

    /// Add a document-level term carrying a value.
    pub fn term_value(&mut self, value: u32, term: &[u8]) {
        self.push(value, 0, term);
    }

    /// Add a term plus its wildcard-expansion entries starting at byte
    /// offset `sp`. Expansion is currently disabled, so only the plain
    /// term is indexed.
    pub fn wterm(&mut self, sp: usize, term: &[u8]) {
        self.term(term);
        if !valid_expansion_term(term) {
            return;
        }
        let mut expanded = Vec::with_capacity(term.len() + 1);
        for end in (sp..=term.len()).rev() {
            expanded.clear();
            expanded.extend_from_slice(&term[..end]);
            expanded.push(b'*');
            self.term(&expanded);
        }
    }

    /// `wterm` with a position (expansion entries share the position).
    pub fn wterm_position(&mut self, pos: u32, sp: usize, term: &[u8]) {
        self.term_position(pos, term);
        if !valid_expansion_term(term) {
            return;
        }
        let mut expanded = Vec::with_capacity(term.len() + 1);
        for end in (sp..=term.len()).rev() {
            expanded.clear();
            expanded.extend_from_slice(&term[..end]);
            expanded.push(b'*');
            self.push(0, pos, &expanded);
        }
    }

    /// `wterm` with a value (expansion entries share the value).
    pub fn wterm_value(&mut self, value: u32, sp: usize, term: &[u8]) {
        self.term_value(value, term);
        if !valid_expansion_term(term) {
            return;
        }
        let mut expanded = Vec::with_capacity(term.len() + 1);
        for end in (sp..=term.len()).rev() {
            expanded.clear();
            expanded.extend_from_slice(&term[..end]);
            expanded.push(b'*');
            self.term_value(value, &expanded);
        }
    }

    fn finish_document(&mut self) {
        if self.global_record.is_empty() {
            return;
        }
        write_u32(self.document_length, &mut self.global_record, 0);
        self.total_documents += 1;
        self.total_terms += self.document_length as u64;
        self.global_sorter
            .push(std::mem::take(&mut self.global_record));
    }

    /// Finalize the previous document and start a new one. The doc id is
    /// read from the first 4 little-endian bytes of `user_data`;
    /// subsequent term operations attach to this document.
    pub fn global(
        &mut self,
        embeddings: &[i8],
        content: &[u8],
        user_data: &[u8],
    ) -> Result<(), String> {
        if user_data.len() < 4 {
            return Err("user data must start with the u32 doc id".to_owned());
        }
        if embeddings.len() % EMBEDDING_SIZE != 0 {
            return Err(format!(
                "embedding block of {} bytes is not a multiple of {}",
                embeddings.len(),
                EMBEDDING_SIZE
            ));
        }
        let id = read_u32(user_data, 0);
        if id > MAX_DOC_ID {
            return Err(format!("doc id {} exceeds 26 bits", id));
        }
        if content.len() > u32::MAX as usize {
            return Err("content exceeds the u32 length capacity".to_owned());
        }
        let main_length = (GLOBAL_HEADER_SIZE + user_data.len()) as u64;
        if main_length >> EMBEDDINGS_OFFSET_BITS != 0 {
            return Err(format!("user data of {} bytes exceeds capacity", user_data.len()));
        }
        self.finish_document();

        // the offset fields carry the section lengths until the final
        // offsets are known at finish
        let header = GlobalHeader {
            document_length: 0,
            num_embeddings: (embeddings.len() / EMBEDDING_SIZE) as u32,
            content_offset: content.len() as u64 + 4,
            embeddings_offset: main_length,
        };
        self.global_record.clear();
        header.write(&mut self.global_record);
        self.global_record.extend_from_slice(user_data);
        self.global_record
            .extend(embeddings.iter().map(|&v| v as u8));
        self.global_record
            .extend_from_slice(&(content.len() as u32).to_le_bytes());
        self.global_record.extend_from_slice(content);

        if id > self.max_id {
            self.max_id = id;
        }
        self.current_id = id;
        self.document_length = 0;
        Ok(())
    }

    /// Drain both external sorts and write the six index files. Returns
    /// the collection statistics also stored in `_stats.txt`.
    pub fn finish(mut self) -> Result<Stats, String> {
        self.finish_document();

        let mut globals = self.global_sorter.finish()?;
        let mut gbl_out = create(&suffixed(&self.base, GBL_SUFFIX))?;
        let mut emb_out = create(&suffixed(&self.base, EMBEDDINGS_SUFFIX))?;
        let mut content_out = create(&suffixed(&self.base, CONTENT_SUFFIX))?;

        let mut total_embeddings: u64 = 0;
        let mut content_offset: u64 = 0;
        let mut header_bytes = Vec::with_capacity(GLOBAL_HEADER_SIZE);
        while let Some(record) = globals.next()? {
            let header = GlobalHeader::read(&record, 0);
            let main_length = header.embeddings_offset as usize;
            let content_length = header.content_offset as usize;
            let embeddings_length = header.num_embeddings as usize * EMBEDDING_SIZE;
            let content_start = main_length + embeddings_length;

            if content_offset >> CONTENT_OFFSET_BITS != 0 {
                return Err("content exceeds the 36-bit offset capacity".to_owned());
            }
            if total_embeddings >> EMBEDDINGS_OFFSET_BITS != 0 {
                return Err("embeddings exceed the 28-bit offset capacity".to_owned());
            }

            let final_header = GlobalHeader {
                document_length: header.document_length,
                num_embeddings: header.num_embeddings,
                content_offset,
                embeddings_offset: total_embeddings,
            };
            header_bytes.clear();
            final_header.write(&mut header_bytes);

            write(&mut gbl_out, &(main_length as u32).to_le_bytes())?;
            write(&mut gbl_out, &header_bytes)?;
            write(&mut gbl_out, &record[GLOBAL_HEADER_SIZE..main_length])?;
            write(&mut emb_out, &record[main_length..content_start])?;
            write(&mut content_out, &record[content_start..content_start + content_length])?;

            total_embeddings += header.num_embeddings as u64;
            content_offset += content_length as u64;
        }
        flush(&mut gbl_out)?;
        flush(&mut emb_out)?;
        flush(&mut content_out)?;

        let mut terms = self.term_sorter.finish()?;
        let mut idx_out = create(&suffixed(&self.base, TERM_IDX_SUFFIX))?;
        let mut data_out = create(&suffixed(&self.base, TERM_DATA_SUFFIX))?;

        let mut bufs = GroupBuffers::default();
        let mut total_term_count: u64 = 0;
        let mut offs: u64 = 4;
        let mut current_term: Vec<u8> = Vec::new();
        let mut records: Vec<TermRecord> = Vec::new();
        while let Some(record) = terms.next()? {
            let term = &record[TERM_RECORD_HEAD..];
            if term != current_term.as_slice() {
                if !records.is_empty() {
                    write_term(
                        &mut idx_out,
                        &mut data_out,
                        &current_term,
                        &records,
                        &mut bufs,
                        &mut offs,
                    )?;
                    total_term_count += 1;
                    records.clear();
                }
                current_term.clear();
                current_term.extend_from_slice(term);
            }
            records.push(TermRecord {
                id: read_u32(&record, 0),
                position: read_u32(&record, 4),
                value: read_u32(&record, 8),
            });
        }
        if !records.is_empty() {
            write_term(
                &mut idx_out,
                &mut data_out,
                &current_term,
                &records,
                &mut bufs,
                &mut offs,
            )?;
            total_term_count += 1;
        }
        flush(&mut idx_out)?;
        flush(&mut data_out)?;

        let stats = Stats {
            total_terms: total_term_count,
            total_documents: self.total_documents,
            total_terms_in_documents: self.total_terms,
            max_id: self.max_id,
        };
        let mut stats_out = create(&suffixed(&self.base, STATS_SUFFIX))?;
        let text = format!(
            "{} {} {} {}\n\
             total_terms: {}\n\
             max_id: {}\n\
             total_documents: {}\n\
             total_terms_in_documents: {}\n\
             average document length: {}\n",
            stats.total_terms,
            stats.total_documents,
            stats.total_terms_in_documents,
            stats.max_id,
            stats.total_terms,
            stats.max_id,
            stats.total_documents,
            stats.total_terms_in_documents,
            stats.average_document_length(),
        );
        write(&mut stats_out, text.as_bytes())?;
        flush(&mut stats_out)?;

        if !self.mute {
            println!(
                "index {} committed: {} terms, {} documents, {} document terms",
                self.base.display(),
                stats.total_terms.to_formatted_string(&Locale::en),
                stats.total_documents.to_formatted_string(&Locale::en),
                stats.total_terms_in_documents.to_formatted_string(&Locale::en),
            );
        }
        Ok(stats)
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, String> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| format!("unable to create {}: {}", path.display(), e))
}

fn write(out: &mut BufWriter<File>, bytes: &[u8]) -> Result<(), String> {
    out.write_all(bytes)
        .map_err(|e| format!("unable to write index file: {}", e))
}

fn flush(out: &mut BufWriter<File>) -> Result<(), String> {
    out.flush()
        .map_err(|e| format!("unable to write index file: {}", e))
}

fn write_term(
    idx_out: &mut BufWriter<File>,
    data_out: &mut BufWriter<File>,
    term: &[u8],
    records: &[TermRecord],
    bufs: &mut GroupBuffers,
    offs: &mut u64,
) -> Result<(), String> {
    let (document_frequency, max_positions) = compress_groups(records, bufs);

    write(idx_out, term)?;
    write(idx_out, &[0u8])?;
    write(idx_out, &offs.to_le_bytes())?;

    let payload_length = (bufs.top.len() + TERM_HEADER_SIZE) as u32;
    *offs += payload_length as u64 + 4;
    write(data_out, &payload_length.to_le_bytes())?;
    write(data_out, &max_positions.to_le_bytes())?;
    write(data_out, &document_frequency.to_le_bytes())?;
    write(data_out, &bufs.top)?;
    Ok(())
}

// Walk one term's records (sorted by doc id, position) and emit the
// three-level group tree: top groups on bits 18..25, mid groups on bits
// 10..17, one inner record per distinct small id.
fn compress_groups(records: &[TermRecord], bufs: &mut GroupBuffers) -> (u32, u32) {
    let mut document_frequency = 0u32;
    let mut max_positions = 0u32;
    bufs.top.clear();
    let mut p = 0;
    while p < records.len() {
        let top = records[p].id & TOP_GROUP_MASK;
        let mut top_end = p;
        while top_end < records.len() && records[top_end].id & TOP_GROUP_MASK == top {
            top_end += 1;
        }

        bufs.mid.clear();
        let mut p2 = p;
        while p2 < top_end {
            let group = records[p2].id & GROUP_MASK;
            let mut group_end = p2;
            while group_end < top_end && records[group_end].id & GROUP_MASK == group {
                group_end += 1;
            }

            bufs.group.clear();
            let mut p3 = p2;
            while p3 < group_end {
                let small = records[p3].id & SMALL_ID_MASK;
                let mut record_end = p3;
                while record_end < group_end && records[record_end].id & SMALL_ID_MASK == small {
                    record_end += 1;
                }
                bufs.occurrences.clear();
                bufs.occurrences.extend(records[p3..record_end].iter().map(|r| Occurrence {
                    position: r.position,
                    value: r.value,
                }));
                let control = (small as u16) << CONTROL_ID_SHIFT;
                document_frequency += 1;
                let num_positions =
                    encode_record(&mut bufs.group, &mut bufs.tmp, control, true, &bufs.occurrences);
                if num_positions > max_positions {
                    max_positions = num_positions;
                }
                p3 = record_end;
            }
            encode_group(
                &mut bufs.mid,
                ((group & MID_GROUP_MASK) >> MID_GROUP_SHIFT) as u8,
                &bufs.group,
            );
            p2 = group_end;
        }
        encode_group(&mut bufs.top, (top >> TOP_GROUP_SHIFT) as u8, &bufs.mid);
        p = top_end;
    }
    (document_frequency, max_positions)
}
