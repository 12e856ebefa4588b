//! Integration tests driving the public API end to end: single-document
//! images, multi-document index build/load round-trips, cursor seeks,
//! ranking primitives and snippet extraction.
//! Use: cargo test
//! To show output use: cargo test -- --show-output

use basalt::builder::IndexWriter;
use basalt::document::{DocumentBuilder, DocumentImage, TermSet};
use basalt::index::{AccessType, EMBEDDING_SIZE, SearchImage};
use basalt::score;
use basalt::snippets::{SnippetPosition, snippet_position_sort, snippets_create, snippets_top};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn doc_user_data(doc_id: u32, extra: &[u8]) -> Vec<u8> {
    let mut user_data = doc_id.to_le_bytes().to_vec();
    user_data.extend_from_slice(extra);
    user_data
}

/// single-document image: build, load, enumerate, decode
#[test]
fn test_document_image() {
    let mut builder = DocumentBuilder::new();
    builder.term(b"example");
    builder.term_position(10, b"positional");
    builder.term_position(20, b"positional");
    builder.term_value(42, b"vterm");

    let content = b"This is the document content.";
    let mut embeddings = [0i8; EMBEDDING_SIZE];
    for (i, value) in embeddings.iter_mut().enumerate() {
        *value = ((i % 255) as i32 - 127) as i8;
    }
    let user_data = doc_user_data(1, &[0xAB; 60]);

    let mut buffer = Vec::new();
    builder.global(&mut buffer, &embeddings, content, &user_data).unwrap();

    let image = DocumentImage::new(&buffer).unwrap();
    assert_eq!(image.header().document_length_for_bm25, 2);
    assert_eq!(image.header().num_embeddings, 1);
    assert_eq!(image.content(), content);
    assert_eq!(image.user_data(), &user_data[..]);
    assert_eq!(image.embeddings(), &embeddings[..]);

    let terms = image.terms();
    assert_eq!(terms, vec![&b"example"[..], &b"positional"[..], &b"vterm"[..]]);

    let mut cursor = image.term(b"positional").unwrap();
    assert!(cursor.advance());
    assert_eq!(cursor.doc_id(), 1);
    assert_eq!(cursor.value(), 0);
    cursor.decode_positions();
    assert_eq!(cursor.positions(), &[10, 20]);
    assert!(!cursor.advance());

    let mut cursor = image.term(b"vterm").unwrap();
    assert!(cursor.advance());
    assert_eq!(cursor.value(), 42);
    cursor.decode_positions();
    assert!(cursor.positions().is_empty());

    let mut cursor = image.term(b"example").unwrap();
    assert!(cursor.advance());
    assert_eq!(cursor.value(), 0);

    assert!(image.term(b"absent").is_none());
    // a miss with a trailing star retries without it
    assert!(image.term(b"vterm*").is_some());
}

/// the embedding block starts 64-byte aligned and terms are case folded
#[test]
fn test_document_image_alignment_and_folding() {
    let mut builder = DocumentBuilder::new();
    builder.term(b"MiXeD-Case");
    builder.wterm(0, b"WildCard");

    let embeddings = [3i8; EMBEDDING_SIZE * 2];
    let mut buffer = Vec::new();
    builder
        .global(&mut buffer, &embeddings, b"x", &doc_user_data(9, &[]))
        .unwrap();

    let image = DocumentImage::new(&buffer).unwrap();
    // wterm indexes the plain term only (expansion is disabled)
    assert_eq!(image.terms(), vec![&b"mixed-case"[..], &b"wildcard"[..]]);
    assert_eq!(image.embeddings().len(), EMBEDDING_SIZE * 2);

    let embeddings_offset = buffer.len() - EMBEDDING_SIZE * 2;
    assert_eq!(embeddings_offset % 64, 0);
}

/// a misaligned embedding block is rejected before anything is emitted
#[test]
fn test_document_builder_rejects_misaligned_embeddings() {
    let mut builder = DocumentBuilder::new();
    builder.term(b"kept");
    let mut buffer = Vec::new();
    assert!(
        builder
            .global(&mut buffer, &[0i8; 100], b"", &doc_user_data(1, &[]))
            .is_err()
    );
    // the pending document survives a rejected call
    builder.global(&mut buffer, &[], b"", &doc_user_data(1, &[])).unwrap();
    let image = DocumentImage::new(&buffer).unwrap();
    assert_eq!(image.terms(), vec![&b"kept"[..]]);
}

/// term sets resolve every query term against an image in one pass
#[test]
fn test_term_set() {
    let mut builder = DocumentBuilder::new();
    builder.term_position(1, b"alpha");
    builder.term_position(2, b"beta");
    builder.term_position(3, b"alpha");
    let mut buffer = Vec::new();
    builder.global(&mut buffer, &[], b"", &doc_user_data(5, &[])).unwrap();
    let image = DocumentImage::new(&buffer).unwrap();

    let mut set = TermSet::new(&[&b"Alpha"[..], &b"missing"[..], &b"alpha"[..], &b"beta"[..]]);
    assert_eq!(set.terms().len(), 3);
    assert_eq!(set.term_index(), &[0, 2, 0, 1]);
    assert_eq!(set.terms()[0].query_term_freq, 2);

    let matched = set.match_set(&image);
    assert_eq!(matched, 2);
    let alpha = &set.terms()[0];
    assert_eq!(alpha.cursor.as_ref().unwrap().positions(), &[1, 3]);
    assert!(set.terms()[2].cursor.is_none());

    set.update_frequency(&image);
    assert_eq!(set.terms()[0].freq, 1);
    assert_eq!(set.terms()[2].freq, 0);
}

fn build_index(docs: &[(u32, Vec<(Vec<u8>, u32)>)], dir: &tempfile::TempDir) -> PathBuf {
    let base = dir.path().join("idx");
    let mut writer = IndexWriter::new(&base, 1 << 20, true);
    for (doc_id, terms) in docs {
        writer.global(&[], b"", &doc_user_data(*doc_id, &[])).unwrap();
        for (term, position) in terms {
            if *position == 0 {
                writer.term(term);
            } else {
                writer.term_position(*position, term);
            }
        }
    }
    writer.finish().unwrap();
    base
}

/// doc ids crossing small/mid/top group boundaries iterate in order
#[test]
fn test_three_level_groups() {
    let dir = tempfile::tempdir().unwrap();
    let ids = [0u32, 1023, 1024, 262143, 262144];
    let docs: Vec<(u32, Vec<(Vec<u8>, u32)>)> = ids
        .iter()
        .map(|&id| (id, vec![(b"t".to_vec(), 0)]))
        .collect();
    let base = build_index(&docs, &dir);

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    let mut cursor = image.term(b"t").unwrap();
    assert_eq!(cursor.document_frequency(), 5);
    let mut seen = Vec::new();
    while cursor.advance() {
        seen.push(cursor.doc_id());
    }
    assert_eq!(seen, ids);

    let mut cursor = image.term(b"t").unwrap();
    assert!(cursor.advance_to(1024));
    assert_eq!(cursor.doc_id(), 1024);
    // seeking backwards or to the current id is a no-op
    assert!(cursor.advance_to(1024));
    assert_eq!(cursor.doc_id(), 1024);
    assert!(cursor.advance_to(3));
    assert_eq!(cursor.doc_id(), 1024);

    // seeking to an absent id lands on the next one
    let mut cursor = image.term(b"t").unwrap();
    assert!(cursor.advance_to(500));
    assert_eq!(cursor.doc_id(), 1023);
    assert!(cursor.advance_to(262144));
    assert_eq!(cursor.doc_id(), 262144);
    assert!(!cursor.advance_to(262145));
}

/// a seek whose top-level group is absent lands on the next populated one
#[test]
fn test_seek_across_absent_top_group() {
    let dir = tempfile::tempdir().unwrap();
    let docs = vec![
        (5u32, vec![(b"t".to_vec(), 0)]),
        (600000u32, vec![(b"t".to_vec(), 0)]),
    ];
    let base = build_index(&docs, &dir);
    let image = SearchImage::open(&base, AccessType::Ram).unwrap();

    let mut cursor = image.term(b"t").unwrap();
    assert!(cursor.advance_to(300000));
    assert_eq!(cursor.doc_id(), 600000);

    let mut cursor = image.term(b"t").unwrap();
    assert!(!cursor.advance_to(600001));
}

/// values of every width class survive the index round-trip
#[test]
fn test_value_classes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("idx");
    let values = [0u32, 1, 28, 29, 255, 256, 65535, 65536, u32::MAX];
    let mut writer = IndexWriter::new(&base, 1 << 20, true);
    for (i, value) in values.iter().enumerate() {
        writer
            .global(&[], b"", &doc_user_data(i as u32, &[]))
            .unwrap();
        writer.term_value(*value, b"v");
    }
    writer.finish().unwrap();

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    let mut cursor = image.term(b"v").unwrap();
    let mut seen = Vec::new();
    while cursor.advance() {
        seen.push(cursor.value());
    }
    assert_eq!(seen, values);
}

/// randomized build-then-enumerate round-trip across group boundaries
#[test]
fn test_index_roundtrip_random() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let dir = tempfile::tempdir().unwrap();

    let vocabulary: Vec<Vec<u8>> = (0..17).map(|i| format!("term{:02}", i).into_bytes()).collect();
    let mut doc_ids: Vec<u32> = Vec::new();
    while doc_ids.len() < 60 {
        let id = rng.gen_range(0..2_000_000);
        if !doc_ids.contains(&id) {
            doc_ids.push(id);
        }
    }

    // expected: term -> doc id -> sorted positions
    let mut expected: BTreeMap<Vec<u8>, BTreeMap<u32, Vec<u32>>> = BTreeMap::new();
    let mut docs: Vec<(u32, Vec<(Vec<u8>, u32)>)> = Vec::new();
    for &doc_id in &doc_ids {
        let mut terms = Vec::new();
        for term in &vocabulary {
            if rng.gen_bool(0.4) {
                let count = rng.gen_range(1..8);
                let mut position = 0u32;
                let mut positions = Vec::new();
                for _ in 0..count {
                    position += rng.gen_range(1..70000);
                    positions.push(position);
                    terms.push((term.clone(), position));
                }
                expected.entry(term.clone()).or_default().insert(doc_id, positions);
            }
        }
        docs.push((doc_id, terms));
    }
    let base = build_index(&docs, &dir);

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    assert_eq!(image.total_documents(), doc_ids.len() as u64);
    assert_eq!(image.total_terms(), expected.len() as u64);
    assert_eq!(image.stats().max_id, *doc_ids.iter().max().unwrap());

    let dictionary = image.terms();
    let expected_terms: Vec<&[u8]> = expected.keys().map(|t| t.as_slice()).collect();
    assert_eq!(dictionary, expected_terms);

    for (term, docs) in &expected {
        let mut cursor = image.term(term).unwrap();
        assert_eq!(cursor.document_frequency() as usize, docs.len());
        let max_positions = docs.values().map(|p| p.len()).max().unwrap();
        assert_eq!(cursor.max_positions() as usize, max_positions);

        let mut expected_docs = docs.iter();
        while cursor.advance() {
            let (&doc_id, positions) = expected_docs.next().unwrap();
            assert_eq!(cursor.doc_id(), doc_id);
            cursor.decode_positions();
            assert_eq!(cursor.positions(), &positions[..]);
        }
        assert!(expected_docs.next().is_none());

        // seek to every doc id and to the gaps around it
        for (&doc_id, _) in docs.iter() {
            let mut cursor = image.term(term).unwrap();
            assert!(cursor.advance_to(doc_id));
            assert_eq!(cursor.doc_id(), doc_id);
        }
        // a seek past the last doc id reports exhaustion
        let last = *docs.keys().last().unwrap();
        let mut cursor = image.term(term).unwrap();
        assert!(!cursor.advance_to(last + 1));
    }
}

/// a tiny sort buffer forces run spilling without changing the output
#[test]
fn test_index_build_with_spill() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("idx");
    let mut writer = IndexWriter::new(&base, 64, true);
    for doc_id in 0..200u32 {
        writer.global(&[], b"", &doc_user_data(doc_id, &[])).unwrap();
        writer.term_position(1 + doc_id % 7, b"common");
        if doc_id % 3 == 0 {
            writer.term(b"sparse");
        }
    }
    let stats = writer.finish().unwrap();
    assert_eq!(stats.total_documents, 200);
    assert_eq!(stats.total_terms, 2);

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    let mut cursor = image.term(b"common").unwrap();
    let mut count = 0;
    let mut expected_id = 0;
    while cursor.advance() {
        assert_eq!(cursor.doc_id(), expected_id);
        cursor.decode_positions();
        assert_eq!(cursor.positions(), &[1 + expected_id % 7]);
        expected_id += 1;
        count += 1;
    }
    assert_eq!(count, 200);
    assert_eq!(image.term(b"sparse").unwrap().document_frequency(), 67);
    // run files are cleaned up after the merge
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".sort"))
        .collect();
    assert!(leftovers.is_empty());
}

/// duplicate (term, doc, position) records collapse to one posting
#[test]
fn test_duplicate_postings_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("idx");
    let mut writer = IndexWriter::new(&base, 1 << 20, true);
    writer.global(&[], b"", &doc_user_data(3, &[])).unwrap();
    writer.term_position(10, b"t");
    writer.term_position(10, b"t");
    writer.term_position(20, b"t");
    writer.finish().unwrap();

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    let mut cursor = image.term(b"t").unwrap();
    assert!(cursor.advance());
    cursor.decode_positions();
    assert_eq!(cursor.positions(), &[10, 20]);
    assert!(!cursor.advance());
}

/// global headers, user data, content and embeddings survive the build
#[test]
fn test_global_side_tables() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("idx");
    let mut writer = IndexWriter::new(&base, 1 << 20, true);

    let first_embeddings = [7i8; EMBEDDING_SIZE];
    writer
        .global(&first_embeddings, b"first content", &doc_user_data(2, b"payload-a"))
        .unwrap();
    writer.term_position(1, b"one");
    writer.term_position(2, b"two");

    let second_embeddings = [-9i8; EMBEDDING_SIZE * 2];
    writer
        .global(&second_embeddings, b"second", &doc_user_data(7, b"payload-b"))
        .unwrap();
    writer.term_position(1, b"one");
    writer.finish().unwrap();

    let image = SearchImage::open(&base, AccessType::Ram).unwrap();
    assert_eq!(image.max_id_bound(), 8);
    assert!(image.global(3).is_none());
    assert!(image.global(100).is_none());

    let (header, user_data) = image.global(2).unwrap();
    assert_eq!(header.document_length, 2);
    assert_eq!(header.num_embeddings, 1);
    assert_eq!(user_data, doc_user_data(2, b"payload-a").as_slice());
    assert_eq!(image.content(&header), b"first content");
    assert_eq!(image.embeddings(&header), &first_embeddings[..]);

    let (header, user_data) = image.global(7).unwrap();
    assert_eq!(header.document_length, 1);
    assert_eq!(header.num_embeddings, 2);
    assert_eq!(user_data, doc_user_data(7, b"payload-b").as_slice());
    assert_eq!(image.content(&header), b"second");
    assert_eq!(image.embeddings(&header), &second_embeddings[..]);

    assert!((image.average_document_length() - 1.5).abs() < 1e-9);
}

/// Ram and Mmap access see identical data
#[test]
fn test_access_types_agree() {
    let dir = tempfile::tempdir().unwrap();
    let docs = vec![
        (1u32, vec![(b"shared".to_vec(), 4)]),
        (9u32, vec![(b"shared".to_vec(), 8)]),
    ];
    let base = build_index(&docs, &dir);

    let ram = SearchImage::open(&base, AccessType::Ram).unwrap();
    let mmap = SearchImage::open(&base, AccessType::Mmap).unwrap();
    assert_eq!(ram.terms(), mmap.terms());

    let mut ram_cursor = ram.term(b"shared").unwrap();
    let mut mmap_cursor = mmap.term(b"shared").unwrap();
    while ram_cursor.advance() {
        assert!(mmap_cursor.advance());
        assert_eq!(ram_cursor.doc_id(), mmap_cursor.doc_id());
        ram_cursor.decode_positions();
        mmap_cursor.decode_positions();
        assert_eq!(ram_cursor.positions(), mmap_cursor.positions());
    }
    assert!(!mmap_cursor.advance());
}

/// capacity violations fail the build loudly
#[test]
fn test_capacity_errors() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("idx");
    let mut writer = IndexWriter::new(&base, 1 << 20, true);
    assert!(writer.global(&[], b"", b"xy").is_err());
    assert!(
        writer
            .global(&[0i8; 100], b"", &doc_user_data(1, &[]))
            .is_err()
    );
    assert!(
        writer
            .global(&[], b"", &doc_user_data(1 << 26, &[]))
            .is_err()
    );
    assert!(writer.global(&[], b"", &doc_user_data(1, &[])).is_ok());
}

/// BM25, BM25+ and idf match their formulas
#[test]
fn test_bm25_primitives() {
    let idf = score::idf(1000.0, 10.0);
    assert!((idf - 4.557379522151743).abs() < 1e-6);

    let doc_norm = score::bm25_doc_norm(100.0, 80.0, score::K1, score::B);
    assert!((doc_norm - 1.425).abs() < 1e-9);

    let bm25 = score::bm25(idf, score::bm25_tf(3.0, score::K1, doc_norm));
    assert!((bm25 - 6.797447422870397).abs() < 1e-6);

    let idf_qtf = score::idf_qtf(1000.0, 10.0, 2.0, score::K3);
    let bm25_plus = score::bm25_plus(
        idf_qtf,
        score::bm25_plus_tf(3.0, score::DELTA, score::K1, doc_norm),
    );
    assert!((bm25_plus - 16.313873814888954).abs() < 1e-6);

    // spread boosts the saturated term frequency
    let spread = score::spread_score(&[10, 20]);
    let boosted = score::bm25_plus_tf_spread(3.0, score::DELTA, score::K1, doc_norm, spread);
    let plain = score::bm25_plus_tf(3.0, score::DELTA, score::K1, doc_norm);
    assert!((boosted - plain * (1.0 + spread)).abs() < 1e-12);

    // edge cases: no matching documents, and every document matching
    let n = 1000.0;
    assert!((score::idf(n, 0.0) - ((n + 1.0) / 0.5).ln()).abs() < 1e-12);
    assert!(score::idf(n, n) >= 0.0);
}

/// spread score decays with position and caps at five occurrences
#[test]
fn test_spread_score() {
    assert_eq!(score::spread_score(&[]), 0.0);
    assert!((score::spread_score(&[10]) - 0.1).abs() < 1e-12);
    assert!((score::spread_score(&[10, 20]) - 0.05583333333333333).abs() < 1e-12);
    // occurrences beyond the fifth are ignored
    let capped = score::spread_score(&[1, 2, 3, 4, 5]);
    assert_eq!(capped, score::spread_score(&[1, 2, 3, 4, 5, 1000, 2000]));
}

/// pair proximity picks the closest in-order pair
#[test]
fn test_pair_proximity() {
    assert_eq!(score::pair_proximity(&[5, 20], &[3, 22]), 2);
    assert_eq!(score::pair_proximity(&[], &[3]), u32::MAX);
    assert_eq!(score::pair_proximity(&[3], &[]), u32::MAX);
    // equal positions are skipped without a score
    assert_eq!(score::pair_proximity(&[5], &[5]), u32::MAX);
    // fully out of order: penalty of one on top of the distance
    assert_eq!(score::pair_proximity(&[10, 15], &[1, 2]), 9);
}

fn snippet_input() -> Vec<SnippetPosition> {
    let raw: &[(usize, f64, u32, u32)] = &[
        (1, 2.0, 0, 0x1),
        (3, 1.5, 1, 0x3),
        (5, 1.0, 2, 0x2),
        (7, 2.5, 0, 0x2),
        (10, 3.0, 3, 0x4),
        (12, 2.0, 1, 0x4),
        (14, 1.0, 0, 0x5),
        (18, 2.0, 4, 0x1),
        (20, 1.5, 2, 0x2),
        (60, 1.0, 3, 0x4),
        (61, 1.0, 3, 0x4),
        (62, 1.0, 3, 0x4),
    ];
    raw.iter()
        .map(|&(position, weight, term_index, query_mask)| SnippetPosition {
            position,
            weight,
            term_index,
            query_mask,
        })
        .collect()
}

/// clustering splits on large gaps, cluster boundaries are flagged
#[test]
fn test_snippets_clusters() {
    let mut positions = snippet_input();
    let merged = snippet_position_sort(&mut positions);
    assert_eq!(merged, positions.len());

    let snippets = snippets_create(&positions, 20);
    assert_eq!(snippets.len(), 2);

    assert_eq!(snippets[0].start, 1);
    assert_eq!(snippets[0].end, 20);
    assert!(!snippets[0].next_in_cluster);
    assert!(snippets[0].score > 0.0);
    assert!(snippets[0].match_count > 0);

    assert_eq!(snippets[1].start, 60);
    assert_eq!(snippets[1].end, 62);
    assert!(!snippets[1].next_in_cluster);
    // three occurrences of one term for query 2
    assert_eq!(snippets[1].match_count, 3);
    assert_eq!(snippets[1].distinct_match_count, 1);
    assert_eq!(snippets[1].query_index, 2);

    // the early snippet gets the position-ratio boost
    assert!(snippets[0].index == 0 && snippets[1].index == 1);
}

/// duplicate (position, term) entries merge their query masks
#[test]
fn test_snippet_position_merge() {
    let mut positions = vec![
        SnippetPosition { position: 4, weight: 1.0, term_index: 2, query_mask: 0x1 },
        SnippetPosition { position: 4, weight: 1.0, term_index: 2, query_mask: 0x4 },
        SnippetPosition { position: 2, weight: 1.0, term_index: 1, query_mask: 0x2 },
    ];
    let merged = snippet_position_sort(&mut positions);
    assert_eq!(merged, 2);
    assert_eq!(positions[0].position, 2);
    assert_eq!(positions[1].position, 4);
    assert_eq!(positions[1].query_mask, 0x5);
}

/// a wide cluster is segmented recursively into bounded windows
#[test]
fn test_snippets_recursive_segmentation() {
    let mut positions: Vec<SnippetPosition> = (0..30)
        .map(|i| SnippetPosition {
            position: 260 + i * 15,
            weight: 1.0 + (i % 3) as f64,
            term_index: (i % 6) as u32,
            query_mask: 0x1,
        })
        .collect();
    snippet_position_sort(&mut positions);

    let snippets = snippets_create(&positions, 40);
    assert!(snippets.len() > 1);
    for pair in snippets.windows(2) {
        assert!(pair[0].start < pair[1].start);
        assert!(pair[0].next_in_cluster);
    }
    assert!(!snippets.last().unwrap().next_in_cluster);
    for (i, snippet) in snippets.iter().enumerate() {
        assert!(snippet.start <= snippet.end);
        assert_eq!(snippet.index, i);
    }
}

/// top-k diversification fades repeated term combinations and restores
/// creation order on the kept prefix
#[test]
fn test_snippets_top() {
    let mut positions = snippet_input();
    snippet_position_sort(&mut positions);
    let mut snippets = snippets_create(&positions, 20);

    let kept = snippets_top(&mut snippets);
    assert!(kept >= 1);
    assert!(kept <= snippets.len());
    for pair in snippets[..kept].windows(2) {
        assert!(pair[0].index < pair[1].index);
    }
}
