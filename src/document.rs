use crate::index::EMBEDDING_SIZE;
use crate::postings::{Occurrence, encode_record, skip_record};
use crate::term::TermCursor;
use crate::utils::{nul_len, read_u32, write_u32};

/// Fixed-size header of a self-contained document image.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentHeader {
    /// Term count for BM25 (number of positional term calls).
    pub document_length_for_bm25: u32,
    /// Byte length of the term block.
    pub term_length: u32,
    /// Byte length of the user data blob.
    pub data_length: u32,
    /// Byte length of the raw content.
    pub content_length: u32,
    /// Number of 512-byte embedding vectors.
    pub num_embeddings: u32,
    /// Number of term records received while building.
    pub num_terms: u32,
}

pub(crate) const DOCUMENT_HEADER_SIZE: usize = 24;

impl DocumentHeader {
    fn read(data: &[u8], pos: usize) -> DocumentHeader {
        DocumentHeader {
            document_length_for_bm25: read_u32(data, pos),
            term_length: read_u32(data, pos + 4),
            data_length: read_u32(data, pos + 8),
            content_length: read_u32(data, pos + 12),
            num_embeddings: read_u32(data, pos + 16),
            num_terms: read_u32(data, pos + 20),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.document_length_for_bm25.to_le_bytes());
        out.extend_from_slice(&self.term_length.to_le_bytes());
        out.extend_from_slice(&self.data_length.to_le_bytes());
        out.extend_from_slice(&self.content_length.to_le_bytes());
        out.extend_from_slice(&self.num_embeddings.to_le_bytes());
        out.extend_from_slice(&self.num_terms.to_le_bytes());
    }
}

struct PendingTerm {
    occurrence: Occurrence,
    term: Vec<u8>,
}

// The wildcard-expansion hook. Expansion is disabled: nothing is admitted,
// the wterm operations index the plain term only.
fn valid_expansion_term(_term: &[u8]) -> bool {
    false
}

/// Builds a self-contained single-document image: terms are collected
/// between construction and `global`, which emits one self-delimiting
/// buffer with inlined postings, user data, content and embeddings.
///
/// ASCII letters of every term are folded to lower case; other bytes pass
/// through unchanged.
#[derive(Default)]
pub struct DocumentBuilder {
    pending: Vec<PendingTerm>,
    document_length_for_bm25: u32,
    term_block: Vec<u8>,
    tmp: Vec<u8>,
    occurrences: Vec<Occurrence>,
}

impl DocumentBuilder {
    /// Create an empty builder.
    pub fn new() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    fn push(&mut self, value: u32, position: u32, term: &[u8]) {
        self.pending.push(PendingTerm {
            occurrence: Occurrence { position, value },
            term: term.to_ascii_lowercase(),
        });
    }

    /// Add a document-level term (no position, no value).
    pub fn term(&mut self, term: &[u8]) {
        self.push(0, 0, term);
    }

    /// Add a term occurrence at token position `pos`; counts towards the
    /// BM25 document length.
    pub fn term_position(&mut self, pos: u32, term: &[u8]) {
        self.document_length_for_bm25 += 1;
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

    /// Finalize the pending document into `out` and reset the builder.
    ///
    /// Layout: `u32` total length (excluding itself), header, user data,
    /// term block, content, zero padding to a 64-byte boundary, then the
    /// embedding block (`embeddings.len()` must be a multiple of 512).
    pub fn global(
        &mut self,
        out: &mut Vec<u8>,
        embeddings: &[i8],
        content: &[u8],
        user_data: &[u8],
    ) -> Result<(), String> {
        if embeddings.len() % EMBEDDING_SIZE != 0 {
            return Err(format!(
                "embedding block of {} bytes is not a multiple of {}",
                embeddings.len(),
                EMBEDDING_SIZE
            ));
        }
        if content.len() > u32::MAX as usize {
            return Err("content exceeds the u32 length capacity".to_owned());
        }
        if user_data.len() > u32::MAX as usize {
            return Err("user data exceeds the u32 length capacity".to_owned());
        }

        self.pending.sort_by(|a, b| {
            a.term
                .cmp(&b.term)
                .then(a.occurrence.position.cmp(&b.occurrence.position))
        });
        let num_terms = self.pending.len() as u32;

        self.term_block.clear();
        let mut i = 0;
        while i < self.pending.len() {
            let mut j = i + 1;
            while j < self.pending.len() && self.pending[j].term == self.pending[i].term {
                j += 1;
            }
            self.term_block.extend_from_slice(&self.pending[i].term);
            self.term_block.push(0);
            self.occurrences.clear();
            self.occurrences
                .extend(self.pending[i..j].iter().map(|t| t.occurrence));
            encode_record(&mut self.term_block, &mut self.tmp, 0, false, &self.occurrences);
            i = j;
        }

        let header = DocumentHeader {
            document_length_for_bm25: self.document_length_for_bm25,
            term_length: self.term_block.len() as u32,
            data_length: user_data.len() as u32,
            content_length: content.len() as u32,
            num_embeddings: (embeddings.len() / EMBEDDING_SIZE) as u32,
            num_terms,
        };

        out.clear();
        out.extend_from_slice(&0u32.to_le_bytes()); // total length, patched below
        header.write(out);
        out.extend_from_slice(user_data);
        out.extend_from_slice(&self.term_block);
        out.extend_from_slice(content);
        // pad so the embedding block lands on a 64-byte boundary
        let padding = (64 - (out.len() & 63)) & 63;
        out.resize(out.len() + padding, 0);
        out.extend(embeddings.iter().map(|&v| v as u8));
        let total = (out.len() - 4) as u32;
        write_u32(total, out, 0);

        self.pending.clear();
        self.term_block.clear();
        self.tmp.clear();
        self.document_length_for_bm25 = 0;
        Ok(())
    }
}

/// Read-only view over one self-contained document image.
pub struct DocumentImage<'a> {
    document: &'a [u8],
    header: DocumentHeader,
    terms_start: usize,
    content_start: usize,
    embeddings_start: usize,
}

impl<'a> DocumentImage<'a> {
    /// Wrap a buffer produced by `DocumentBuilder::global`.
    pub fn new(document: &'a [u8]) -> Result<DocumentImage<'a>, String> {
        if document.len() < 4 + DOCUMENT_HEADER_SIZE {
            return Err("document image truncated".to_owned());
        }
        let total = read_u32(document, 0) as usize;
        if total != document.len() - 4 {
            return Err("document image length mismatch".to_owned());
        }
        let header = DocumentHeader::read(document, 4);
        let terms_start = 4 + DOCUMENT_HEADER_SIZE + header.data_length as usize;
        let content_start = terms_start + header.term_length as usize;
        let content_end = content_start + header.content_length as usize;
        let embeddings_start = (content_end + 63) & !63;
        if embeddings_start + header.num_embeddings as usize * EMBEDDING_SIZE > document.len() {
            return Err("document image truncated".to_owned());
        }
        Ok(DocumentImage {
            document,
            header,
            terms_start,
            content_start,
            embeddings_start,
        })
    }

    /// The parsed document header.
    pub fn header(&self) -> &DocumentHeader {
        &self.header
    }

    /// The opaque user data blob.
    pub fn user_data(&self) -> &'a [u8] {
        &self.document[4 + DOCUMENT_HEADER_SIZE..self.terms_start]
    }

    /// The raw content bytes.
    pub fn content(&self) -> &'a [u8] {
        &self.document[self.content_start..self.content_start + self.header.content_length as usize]
    }

    /// The embedding block, one 512-byte vector per embedding.
    pub fn embeddings(&self) -> &'a [i8] {
        let bytes = &self.document[self.embeddings_start
            ..self.embeddings_start + self.header.num_embeddings as usize * EMBEDDING_SIZE];
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i8, bytes.len()) }
    }

    /// All terms of the image, in their stored (sorted) order.
    pub fn terms(&self) -> Vec<&'a [u8]> {
        let mut terms = Vec::with_capacity(self.header.num_terms as usize);
        let mut pos = self.terms_start;
        while pos < self.content_start {
            let term_end = pos + nul_len(&self.document[pos..self.content_start]);
            terms.push(&self.document[pos..term_end]);
            pos = skip_record(self.document, term_end + 1);
        }
        terms
    }

    // Merge-walk step: advance `pos` through the sorted term block until
    // `term` is found or passed. On a match returns the record byte range
    // and leaves `pos` after it; on a miss `pos` stays at the first entry
    // greater than `term`, so a walk over sorted terms never re-scans.
    fn seek_from(&self, pos: &mut usize, term: &[u8]) -> Option<(usize, usize)> {
        while *pos < self.content_start {
            let term_end = *pos + nul_len(&self.document[*pos..self.content_start]);
            let entry = &self.document[*pos..term_end];
            if term < entry {
                return None;
            }
            let record_end = skip_record(self.document, term_end + 1);
            *pos = record_end;
            if term == entry {
                return Some((term_end + 1, record_end));
            }
        }
        None
    }

    // Offset of the record bytes of `term`, exploiting the sorted term block.
    fn find(&self, term: &[u8]) -> Option<(usize, usize)> {
        let mut pos = self.terms_start;
        self.seek_from(&mut pos, term)
    }

    /// Look up a term and build its (single-posting) cursor. A miss with a
    /// trailing `*` retries without the star.
    pub fn term(&self, term: &[u8]) -> Option<TermCursor<'a>> {
        let range = match self.find(term) {
            Some(range) => Some(range),
            None if term.last() == Some(&b'*') => self.find(&term[..term.len() - 1]),
            None => None,
        }?;
        Some(TermCursor::from_record(&self.document[range.0..range.1]))
    }
}

/// One query term of a [`TermSet`].
pub struct TermSetEntry<'a> {
    /// The folded term bytes.
    pub term: Vec<u8>,
    /// Occurrences of the term in the query.
    pub query_term_freq: u32,
    /// Number of matched documents accumulated by `update_frequency`.
    pub freq: u32,
    /// Largest position-buffer bound seen across matched documents.
    pub max_positions: u32,
    /// Cursor into the most recently matched image, positions decoded.
    pub cursor: Option<TermCursor<'a>>,
}

/// A deduplicated set of query terms resolvable against document images in
/// one linear merge walk. The tokenizer is the caller's: the set is built
/// from already-split terms.
pub struct TermSet<'a> {
    terms: Vec<TermSetEntry<'a>>,
    term_index: Vec<usize>,
}

impl<'a> TermSet<'a> {
    /// Build a set from query terms in query order. ASCII letters are
    /// folded to lower case, duplicates collapse into `query_term_freq`.
    pub fn new(query_terms: &[&[u8]]) -> TermSet<'a> {
        let mut folded: Vec<(Vec<u8>, usize)> = query_terms
            .iter()
            .enumerate()
            .map(|(position, term)| (term.to_ascii_lowercase(), position))
            .collect();
        folded.sort();

        let mut terms: Vec<TermSetEntry> = Vec::new();
        let mut term_index = vec![0usize; query_terms.len()];
        let mut i = 0;
        while i < folded.len() {
            let mut j = i + 1;
            while j < folded.len() && folded[j].0 == folded[i].0 {
                j += 1;
            }
            for entry in &folded[i..j] {
                term_index[entry.1] = terms.len();
            }
            terms.push(TermSetEntry {
                term: folded[i].0.clone(),
                query_term_freq: (j - i) as u32,
                freq: 0,
                max_positions: 0,
                cursor: None,
            });
            i = j;
        }
        TermSet { terms, term_index }
    }

    /// The distinct terms, sorted.
    pub fn terms(&self) -> &[TermSetEntry<'a>] {
        &self.terms
    }

    /// The distinct terms, sorted (mutable).
    pub fn terms_mut(&mut self) -> &mut [TermSetEntry<'a>] {
        &mut self.terms
    }

    /// Entry index for each original query position.
    pub fn term_index(&self) -> &[usize] {
        &self.term_index
    }

    /// Resolve every term of the set against one image in a single merge
    /// walk over the sorted term block (both sides are sorted, so the
    /// walk position only ever moves forward). Matched entries get a
    /// cursor with positions already decoded; unmatched entries get
    /// `None`. Returns the number of matched terms.
    pub fn match_set(&mut self, image: &DocumentImage<'a>) -> usize {
        let mut matched = 0;
        let mut pos = image.terms_start;
        for entry in &mut self.terms {
            match image.seek_from(&mut pos, &entry.term) {
                Some((start, end)) => {
                    let mut cursor = TermCursor::from_record(&image.document[start..end]);
                    cursor.advance();
                    cursor.decode_positions();
                    entry.cursor = Some(cursor);
                    matched += 1;
                }
                None => entry.cursor = None,
            }
        }
        matched
    }

    /// Accumulate per-term document frequencies and position-buffer bounds
    /// across images, for collection statistics. Same merge walk as
    /// `match_set`.
    pub fn update_frequency(&mut self, image: &DocumentImage<'_>) {
        let mut pos = image.terms_start;
        for entry in &mut self.terms {
            if let Some((start, end)) = image.seek_from(&mut pos, &entry.term) {
                let cursor = TermCursor::from_record(&image.document[start..end]);
                if cursor.max_positions() > entry.max_positions {
                    entry.max_positions = cursor.max_positions();
                }
                entry.freq += 1;
            }
        }
    }

    /// Fold another set's accumulated frequencies into this one (sets must
    /// stem from the same query).
    pub fn merge_frequencies(&mut self, other: &TermSet<'_>) {
        for (entry, other_entry) in self.terms.iter_mut().zip(other.terms.iter()) {
            entry.freq += other_entry.freq;
            if other_entry.max_positions > entry.max_positions {
                entry.max_positions = other_entry.max_positions;
            }
        }
    }
}
