use smallvec::SmallVec;

use crate::postings::{
    CONTROL_FLAGS_MASK, CONTROL_ID_SHIFT, FLAG_POSITIONS, FLAG_VALUE_WITH_POSITIONS, GROUP_MASK,
    MID_GROUP_MASK, MID_GROUP_SHIFT, TOP_GROUP_MASK, TOP_GROUP_SHIFT, decode_position_value,
    decode_positions_header, decode_single_value, read_group, read_varint,
};
use crate::utils::read_u16;

/// Forward iterator over the posting list of one term.
///
/// A freshly built cursor is already positioned on the first document: the
/// first `advance` call yields it without moving. `advance` then walks doc
/// ids in ascending order; `advance_to` seeks to the least id >= target.
/// Term positions of the current document are decoded on demand with
/// `decode_positions`.
///
/// ```ignore
/// let mut cursor = image.term(b"example").unwrap();
/// while cursor.advance() {
///     cursor.decode_positions();
///     println!("{} {:?}", cursor.doc_id(), cursor.positions());
/// }
/// ```
pub struct TermCursor<'a> {
    data: &'a [u8],

    // Nested group regions within data: inner records of the current
    // (top, mid) group live in p..ep, the remaining mid entries of the
    // current top group in ep..tp, the remaining top entries in tp..etp.
    p: usize,
    ep: usize,
    tp: usize,
    etp: usize,

    // top 16 bits of the current group (bits 10..25 of the doc id)
    gid: u32,
    id: u32,
    value: u32,

    // positions blob of the current record, seeded by first_base
    first_base: u32,
    positions_start: usize,
    positions: SmallVec<[u32; 16]>,

    max_positions: u32,
    document_frequency: u32,

    first: bool,
    single: bool,
}

impl<'a> TermCursor<'a> {
    /// Cursor over a hierarchical postings blob from a multi-document index.
    pub(crate) fn from_hierarchical(
        data: &'a [u8],
        max_positions: u32,
        document_frequency: u32,
    ) -> TermCursor<'a> {
        let mut cursor = TermCursor {
            data,
            p: 0,
            ep: 0,
            tp: 0,
            etp: data.len(),
            gid: 0,
            id: 0,
            value: 0,
            first_base: 0,
            positions_start: 0,
            positions: SmallVec::with_capacity(max_positions as usize + 1),
            max_positions,
            document_frequency,
            first: true,
            single: false,
        };
        cursor.advance_top();
        cursor.advance_mid();
        cursor.advance_id();
        cursor
    }

    /// Cursor over the single inner record of a self-contained document
    /// image. There is only one doc id, reported as 1.
    pub(crate) fn from_record(data: &'a [u8]) -> TermCursor<'a> {
        let mut cursor = TermCursor {
            data,
            p: 0,
            ep: data.len(),
            tp: data.len(),
            etp: data.len(),
            gid: 1,
            id: 1,
            value: 0,
            first_base: 0,
            positions_start: 0,
            positions: SmallVec::new(),
            max_positions: 0,
            document_frequency: 1,
            first: true,
            single: true,
        };
        cursor.advance_id();
        // byte length of the positions blob, an upper bound on the count
        cursor.max_positions = (cursor.p - cursor.positions_start) as u32;
        cursor
    }

    /// Doc id of the current posting.
    pub fn doc_id(&self) -> u32 {
        self.id
    }

    /// Value of the current posting (0 when none was stored).
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Largest per-document position count across the whole posting list.
    pub fn max_positions(&self) -> u32 {
        self.max_positions
    }

    /// Number of distinct documents in the posting list.
    pub fn document_frequency(&self) -> u32 {
        self.document_frequency
    }

    /// Move to the next doc id. Returns false when the list is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.first {
            self.first = false;
            return true;
        }
        if self.single {
            return false;
        }
        if self.p < self.ep {
            self.advance_id();
            return true;
        }
        if self.advance_group() {
            self.advance_id();
            return true;
        }
        false
    }

    /// Seek to the least doc id >= `target`. Returns false when the list is
    /// exhausted before the target; a target at or below the current id is
    /// a no-op.
    pub fn advance_to(&mut self, target: u32) -> bool {
        if self.single {
            return true;
        }
        if target <= self.id {
            return true;
        }
        self.first = false;
        let gid = target & GROUP_MASK;
        if self.gid < gid {
            if !self.advance_group_to(gid) {
                return false;
            }
            self.advance_id();
            if gid < self.gid {
                return true;
            }
        }
        while target > self.id && self.p < self.ep {
            self.advance_id();
        }
        if target <= self.id {
            return true;
        }
        if !self.advance_group() {
            return false;
        }
        self.advance_id();
        true
    }

    /// Decode the term positions of the current posting into the cursor's
    /// scratch buffer, retrievable via `positions`.
    pub fn decode_positions(&mut self) {
        self.positions.clear();
        let mut pos = self.positions_start;
        let mut last = self.first_base;
        while pos < self.p {
            last += read_varint(self.data, &mut pos);
            self.positions.push(last);
        }
    }

    /// Positions decoded by the last `decode_positions` call.
    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    fn advance_id(&mut self) {
        let mut pos = self.p;
        let flags;
        if self.single {
            let control = self.data[pos] as u32;
            pos += 1;
            flags = control & CONTROL_FLAGS_MASK;
        } else {
            let control = read_u16(self.data, pos) as u32;
            pos += 2;
            self.id = (control >> CONTROL_ID_SHIFT) + self.gid;
            flags = control & CONTROL_FLAGS_MASK;
        }
        if flags & FLAG_POSITIONS != 0 {
            if flags & FLAG_VALUE_WITH_POSITIONS != 0 {
                self.value = decode_position_value(self.data, &mut pos);
            }
            let (first_base, start, end) = decode_positions_header(flags, self.data, &mut pos);
            self.first_base = first_base;
            self.positions_start = start;
            self.p = end;
        } else {
            self.value = decode_single_value(flags, self.data, &mut pos);
            self.p = pos;
            self.positions_start = pos;
        }
    }

    // Enter the next mid group within the current top group.
    fn advance_mid(&mut self) -> bool {
        if self.ep >= self.tp {
            return false;
        }
        let control = self.data[self.ep] as u32;
        let (start, end) = read_group(self.data, self.ep + 1);
        self.p = start;
        self.ep = end;
        self.gid = (self.gid & TOP_GROUP_MASK) | (control << MID_GROUP_SHIFT);
        true
    }

    // Enter the next top group; the caller descends into its first mid
    // group before decoding records.
    fn advance_top(&mut self) -> bool {
        if self.tp >= self.etp {
            return false;
        }
        let control = self.data[self.tp] as u32;
        let (start, end) = read_group(self.data, self.tp + 1);
        self.ep = start;
        self.tp = end;
        self.gid = control << TOP_GROUP_SHIFT;
        true
    }

    fn advance_group(&mut self) -> bool {
        if self.advance_mid() {
            return true;
        }
        if self.advance_top() {
            return self.advance_mid();
        }
        false
    }

    // Advance groups until gid >= the target group, entering the record
    // group the seek lands in.
    fn advance_group_to(&mut self, gid: u32) -> bool {
        if self.gid >= gid {
            return true;
        }
        if (self.gid & TOP_GROUP_MASK) == (gid & TOP_GROUP_MASK) {
            let target = (gid & MID_GROUP_MASK) >> MID_GROUP_SHIFT;
            while self.ep < self.tp {
                let control = self.data[self.ep] as u32;
                self.advance_mid();
                if control >= target {
                    return true;
                }
            }
            return self.advance_group();
        }
        let target = (gid & TOP_GROUP_MASK) >> TOP_GROUP_SHIFT;
        while self.tp < self.etp {
            let control = self.data[self.tp] as u32;
            self.advance_top();
            if control > target {
                // the target top group is absent, land on the first record
                // group of the next populated one
                return self.advance_mid();
            }
            if control == target {
                let mid_target = (gid & MID_GROUP_MASK) >> MID_GROUP_SHIFT;
                while self.ep < self.tp {
                    let mid_control = self.data[self.ep] as u32;
                    self.advance_mid();
                    if mid_control >= mid_target {
                        return true;
                    }
                }
                return self.advance_group();
            }
        }
        false
    }
}
