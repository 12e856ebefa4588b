#![crate_type = "lib"]
#![crate_name = "basalt"]

//! # `basalt`
//! Basalt is a compact, static, on-disk inverted-index library. Documents
//! are indexed once into a write-once image of six files; readers load
//! the image (RAM or memory-mapped), look up terms and walk their
//! compressed posting lists through forward cursors with skip support.
//! Stateless BM25/BM25+ primitives and a snippet extractor sit on top for
//! the query layer to compose.
//!
//! ### build a multi-document index
//! ```no_run
//! use basalt::builder::IndexWriter;
//! use std::path::Path;
//!
//! let base = Path::new("indexes/wiki");
//! let mut writer = IndexWriter::new(base, 1 << 26, false);
//! // the first 4 bytes of the user data are the doc id
//! let user_data = 7u32.to_le_bytes();
//! writer.global(&[], b"the quick brown fox", &user_data).unwrap();
//! writer.term_position(1, b"quick");
//! writer.term_position(2, b"brown");
//! writer.term_value(42, b"page_rank");
//! let stats = writer.finish().unwrap();
//! println!("{} documents", stats.total_documents);
//! ```
//! ### load the image and walk a posting list
//! ```no_run
//! use basalt::index::{AccessType, SearchImage};
//! use std::path::Path;
//!
//! let image = SearchImage::open(Path::new("indexes/wiki"), AccessType::Mmap).unwrap();
//! let mut cursor = image.term(b"quick").unwrap();
//! while cursor.advance() {
//!     cursor.decode_positions();
//!     println!("doc {} positions {:?}", cursor.doc_id(), cursor.positions());
//! }
//! ```
//! ### build a self-contained single-document image
//! ```
//! use basalt::document::{DocumentBuilder, DocumentImage};
//!
//! let mut builder = DocumentBuilder::new();
//! builder.term_position(10, b"Example");
//! let mut buffer = Vec::new();
//! builder.global(&mut buffer, &[], b"content", &1u32.to_le_bytes()).unwrap();
//! let image = DocumentImage::new(&buffer).unwrap();
//! assert!(image.term(b"example").is_some());
//! ```

/// Build a multi-document index via external sort and emit the six
/// on-disk files (`_term_idx`, `_term_data`, `_gbl`, `_embeddings`,
/// `_content`, `_stats.txt`).
pub mod builder;
/// Build and read self-contained single-document images, and resolve
/// query term sets against them.
pub mod document;
/// Load an index image from disk and look up global headers, content,
/// embeddings and term cursors.
pub mod index;
pub(crate) mod postings;
/// Stateless BM25/BM25+ ranking primitives: idf, query term frequency
/// weighting, document-length normalization, spread and pair proximity.
pub mod score;
/// Extract the most relevant token windows per query from a matched
/// document ("keyword in context").
pub mod snippets;
pub(crate) mod sort;
/// Forward cursors over compressed posting lists.
pub mod term;
pub(crate) mod utils;
