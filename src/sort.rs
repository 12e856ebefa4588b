use crossbeam_channel::{Receiver, Sender, bounded};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use crate::utils::read_u32;

pub(crate) type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// External merge sort over opaque byte records.
///
/// Records are appended, buffered up to a byte budget, and handed to one
/// helper thread that sorts each full buffer and spills it as a run file
/// next to the index being built. `finish` merges the runs back into a
/// single stream in comparator order; records comparing equal are
/// deduplicated keeping the first appended one. Small inputs that never
/// exceed the budget are sorted in memory without touching disk.
pub(crate) struct ExternalSorter {
    compare: CompareFn,
    buffer: Vec<Vec<u8>>,
    buffered_bytes: usize,
    budget: usize,
    run_prefix: PathBuf,
    sender: Option<Sender<Vec<Vec<u8>>>>,
    worker: Option<JoinHandle<io::Result<Vec<PathBuf>>>>,
}

impl ExternalSorter {
    pub(crate) fn new(run_prefix: PathBuf, budget: usize, compare: CompareFn) -> ExternalSorter {
        ExternalSorter {
            compare,
            buffer: Vec::new(),
            buffered_bytes: 0,
            budget: budget.max(1),
            run_prefix,
            sender: None,
            worker: None,
        }
    }

    pub(crate) fn push(&mut self, record: Vec<u8>) {
        self.buffered_bytes += record.len();
        self.buffer.push(record);
        if self.buffered_bytes >= self.budget {
            self.spill();
        }
    }

    fn spill(&mut self) {
        if self.sender.is_none() {
            let (sender, receiver) = bounded::<Vec<Vec<u8>>>(1);
            let run_prefix = self.run_prefix.clone();
            let compare = self.compare;
            self.worker = Some(std::thread::spawn(move || {
                run_writer(run_prefix, compare, receiver)
            }));
            self.sender = Some(sender);
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;
        // a send failure means the worker died; its join error is surfaced
        // by finish
        let _ = self.sender.as_ref().unwrap().send(batch);
    }

    pub(crate) fn finish(mut self) -> Result<SortedStream, String> {
        if self.sender.is_none() {
            let mut records = std::mem::take(&mut self.buffer);
            let compare = self.compare;
            records.sort_by(|a, b| compare(a, b));
            return Ok(SortedStream {
                compare: self.compare,
                last: None,
                state: StreamState::Memory(records.into_iter()),
            });
        }
        if !self.buffer.is_empty() {
            self.spill();
        }
        drop(self.sender.take());
        let paths = self
            .worker
            .take()
            .unwrap()
            .join()
            .map_err(|_| "external sort worker panicked".to_owned())?
            .map_err(|e| format!("external sort spill failed: {}", e))?;

        let mut readers = Vec::with_capacity(paths.len());
        for path in &paths {
            let file = File::open(path)
                .map_err(|e| format!("unable to open sort run {}: {}", path.display(), e))?;
            readers.push(BufReader::new(file));
        }
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some(record) =
                read_record(reader).map_err(|e| format!("unable to read sort run: {}", e))?
            {
                heap.push(HeapEntry {
                    record,
                    run,
                    compare: self.compare,
                });
            }
        }
        Ok(SortedStream {
            compare: self.compare,
            last: None,
            state: StreamState::Merge {
                readers,
                heap,
                paths,
            },
        })
    }
}

fn run_writer(
    run_prefix: PathBuf,
    compare: CompareFn,
    receiver: Receiver<Vec<Vec<u8>>>,
) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for mut batch in receiver {
        batch.sort_by(|a, b| compare(a, b));
        let mut path = run_prefix.as_os_str().to_os_string();
        path.push(format!(".{}", paths.len()));
        let path = PathBuf::from(path);
        let mut writer = BufWriter::new(File::create(&path)?);
        for record in &batch {
            writer.write_all(&(record.len() as u32).to_le_bytes())?;
            writer.write_all(record)?;
        }
        writer.flush()?;
        paths.push(path);
    }
    Ok(paths)
}

fn read_record(reader: &mut BufReader<File>) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = read_u32(&len_bytes, 0) as usize;
    let mut record = vec![0u8; len];
    reader.read_exact(&mut record)?;
    Ok(Some(record))
}

struct HeapEntry {
    record: Vec<u8>,
    run: usize,
    compare: CompareFn,
}

// Reversed ordering turns the std max-heap into a min-heap; ties prefer
// the lower run index so the earliest appended record survives dedup.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&other.record, &self.record).then(other.run.cmp(&self.run))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

enum StreamState {
    Memory(std::vec::IntoIter<Vec<u8>>),
    Merge {
        readers: Vec<BufReader<File>>,
        heap: BinaryHeap<HeapEntry>,
        paths: Vec<PathBuf>,
    },
}

/// The merged, deduplicated output of an [`ExternalSorter`].
pub(crate) struct SortedStream {
    compare: CompareFn,
    last: Option<Vec<u8>>,
    state: StreamState,
}

impl SortedStream {
    pub(crate) fn next(&mut self) -> Result<Option<Vec<u8>>, String> {
        loop {
            let record = match &mut self.state {
                StreamState::Memory(records) => records.next(),
                StreamState::Merge { readers, heap, .. } => match heap.pop() {
                    Some(entry) => {
                        if let Some(record) = read_record(&mut readers[entry.run])
                            .map_err(|e| format!("unable to read sort run: {}", e))?
                        {
                            heap.push(HeapEntry {
                                record,
                                run: entry.run,
                                compare: self.compare,
                            });
                        }
                        Some(entry.record)
                    }
                    None => None,
                },
            };
            let Some(record) = record else {
                return Ok(None);
            };
            if let Some(last) = &self.last {
                if (self.compare)(last, &record) == Ordering::Equal {
                    continue; // keep first
                }
            }
            self.last = Some(record.clone());
            return Ok(Some(record));
        }
    }
}

impl Drop for SortedStream {
    fn drop(&mut self) {
        if let StreamState::Merge { paths, .. } = &self.state {
            for path in paths {
                let _ = fs::remove_file(path);
            }
        }
    }
}
