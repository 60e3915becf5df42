//! The default segment codec.
//!
//! Metadata files (index meta, segment meta) are JSON; payload files
//! (postings shards, columnstore, document masks) are binary via
//! [`StructWriter`]/[`StructReader`] with delta-compressed id runs and a
//! crc32 footer. The index meta commit is two-phase: phase one writes
//! `pending_segments_<G>`, phase two renames it to `segments_<G>`.

use std::io::Read;
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::warn;

use crate::codec::{
    columnstore_file_name, document_mask_file_name, pending_segments_file_name,
    parse_segments_generation, postings_doc_file_name, postings_pay_file_name,
    postings_pos_file_name, segment_meta_file_name, segments_file_name, Codec, ColumnData,
    ColumnstoreReader, ColumnstoreWriter, DocumentMaskReader, DocumentMaskWriter, FieldPostings,
    IndexMetaReader, IndexMetaWriter, PostingDoc, PostingPosition, PostingsReader, PostingsWriter,
    SegmentMetaReader, SegmentMetaWriter,
};
use crate::error::{Result, XystonError};
use crate::index::meta::{IndexMeta, SegmentMeta};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageOutput};
use crate::types::{DocId, FieldFeatures};

/// Name of the default codec.
pub const BASE_CODEC_NAME: &str = "base";

const FEATURE_FREQUENCY: u8 = 1;
const FEATURE_POSITIONS: u8 = 1 << 1;
const FEATURE_OFFSETS: u8 = 1 << 2;
const FEATURE_PAYLOADS: u8 = 1 << 3;

fn encode_features(features: &FieldFeatures) -> u8 {
    let mut flags = 0;
    if features.frequency {
        flags |= FEATURE_FREQUENCY;
    }
    if features.positions {
        flags |= FEATURE_POSITIONS;
    }
    if features.offsets {
        flags |= FEATURE_OFFSETS;
    }
    if features.payloads {
        flags |= FEATURE_PAYLOADS;
    }
    flags
}

fn decode_features(flags: u8) -> FieldFeatures {
    FieldFeatures {
        frequency: flags & FEATURE_FREQUENCY != 0,
        positions: flags & FEATURE_POSITIONS != 0,
        offsets: flags & FEATURE_OFFSETS != 0,
        payloads: flags & FEATURE_PAYLOADS != 0,
    }
}

/// The default codec implementation.
#[derive(Debug, Default)]
pub struct BaseCodec;

impl BaseCodec {
    /// Create the codec.
    pub fn new() -> Self {
        BaseCodec
    }
}

impl Codec for BaseCodec {
    fn name(&self) -> &str {
        BASE_CODEC_NAME
    }

    fn index_meta_reader(&self) -> Box<dyn IndexMetaReader> {
        Box::new(BaseIndexMetaReader)
    }

    fn index_meta_writer(&self) -> Box<dyn IndexMetaWriter> {
        Box::new(BaseIndexMetaWriter { pending: None })
    }

    fn segment_meta_reader(&self) -> Box<dyn SegmentMetaReader> {
        Box::new(BaseSegmentMetaReader)
    }

    fn segment_meta_writer(&self) -> Box<dyn SegmentMetaWriter> {
        Box::new(BaseSegmentMetaWriter)
    }

    fn document_mask_reader(&self) -> Box<dyn DocumentMaskReader> {
        Box::new(BaseDocumentMaskReader)
    }

    fn document_mask_writer(&self) -> Box<dyn DocumentMaskWriter> {
        Box::new(BaseDocumentMaskWriter { state: None })
    }

    fn postings_writer(&self) -> Box<dyn PostingsWriter> {
        Box::new(BasePostingsWriter)
    }

    fn postings_reader(&self) -> Box<dyn PostingsReader> {
        Box::new(BasePostingsReader)
    }

    fn columnstore_writer(&self) -> Box<dyn ColumnstoreWriter> {
        Box::new(BaseColumnstoreWriter)
    }

    fn columnstore_reader(&self) -> Box<dyn ColumnstoreReader> {
        Box::new(BaseColumnstoreReader)
    }
}

// ---------------------------------------------------------------------------
// index meta
// ---------------------------------------------------------------------------

struct BaseIndexMetaReader;

impl IndexMetaReader for BaseIndexMetaReader {
    fn last_segments_file(&self, storage: &dyn Storage) -> Result<Option<String>> {
        let mut best: Option<(u64, String)> = None;
        for name in storage.list_files()? {
            if let Some(generation) = parse_segments_generation(&name) {
                if best.as_ref().map(|(g, _)| generation > *g).unwrap_or(true) {
                    best = Some((generation, name));
                }
            }
        }
        Ok(best.map(|(_, name)| name))
    }

    fn read(&self, storage: &dyn Storage, filename: &str) -> Result<IndexMeta> {
        let mut input = storage.open_input(filename)?;
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        let meta: IndexMeta = serde_json::from_slice(&data)?;
        Ok(meta)
    }
}

struct PendingMeta {
    storage: Arc<dyn Storage>,
    pending_file: String,
    committed_file: String,
}

struct BaseIndexMetaWriter {
    pending: Option<PendingMeta>,
}

impl IndexMetaWriter for BaseIndexMetaWriter {
    fn filename(&self, meta: &IndexMeta) -> String {
        segments_file_name(meta.generation)
    }

    fn prepare(&mut self, storage: Arc<dyn Storage>, meta: &mut IndexMeta) -> Result<()> {
        if self.pending.is_some() {
            return Err(XystonError::illegal_state(
                "an index meta is already prepared",
            ));
        }

        meta.generation = meta.next_generation();

        let pending_file = pending_segments_file_name(meta.generation);
        let committed_file = segments_file_name(meta.generation);

        let data = serde_json::to_vec_pretty(meta)?;
        let mut output = storage.create_output(&pending_file)?;
        std::io::Write::write_all(&mut output, &data)?;
        output.close()?;
        storage.sync(&pending_file)?;

        self.pending = Some(PendingMeta {
            storage,
            pending_file,
            committed_file,
        });

        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| XystonError::illegal_state("no prepared index meta to commit"))?;

        pending
            .storage
            .rename_file(&pending.pending_file, &pending.committed_file)?;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Err(e) = pending.storage.delete_file(&pending.pending_file) {
                warn!(file = %pending.pending_file, error = %e, "failed to remove tentative index meta");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// segment meta
// ---------------------------------------------------------------------------

struct BaseSegmentMetaReader;

impl SegmentMetaReader for BaseSegmentMetaReader {
    fn read(&self, storage: &dyn Storage, filename: &str) -> Result<SegmentMeta> {
        let mut input = storage.open_input(filename)?;
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        let meta: SegmentMeta = serde_json::from_slice(&data)?;
        Ok(meta)
    }
}

struct BaseSegmentMetaWriter;

impl SegmentMetaWriter for BaseSegmentMetaWriter {
    fn filename(&self, meta: &SegmentMeta) -> String {
        segment_meta_file_name(&meta.name)
    }

    fn write(&self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<String> {
        let filename = self.filename(meta);
        let data = serde_json::to_vec_pretty(meta)?;
        let mut output = storage.create_output(&filename)?;
        std::io::Write::write_all(&mut output, &data)?;
        output.close()?;
        Ok(filename)
    }
}

// ---------------------------------------------------------------------------
// document mask
// ---------------------------------------------------------------------------

struct BaseDocumentMaskReader;

impl DocumentMaskReader for BaseDocumentMaskReader {
    fn read(&self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<Option<RoaringBitmap>> {
        let filename = document_mask_file_name(&meta.name, meta.version);
        if !storage.file_exists(&filename) {
            return Ok(None);
        }

        let input = storage.open_input(&filename)?;
        let mut reader = StructReader::new(input)?;
        let count = reader.read_u32()? as usize;
        let docs = reader.read_delta_u32s(count)?;
        reader.expect_checksum()?;

        let mut mask = RoaringBitmap::new();
        for doc in docs {
            mask.insert(doc);
        }
        Ok(Some(mask))
    }
}

struct MaskWriterState {
    writer: StructWriter<Box<dyn StorageOutput>>,
    expected: u32,
    written: u32,
    previous: DocId,
}

struct BaseDocumentMaskWriter {
    state: Option<MaskWriterState>,
}

impl DocumentMaskWriter for BaseDocumentMaskWriter {
    fn filename(&self, meta: &SegmentMeta) -> String {
        document_mask_file_name(&meta.name, meta.version)
    }

    fn prepare(&mut self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<()> {
        let output = storage.create_output(&self.filename(meta))?;
        self.state = Some(MaskWriterState {
            writer: StructWriter::new(output),
            expected: 0,
            written: 0,
            previous: 0,
        });
        Ok(())
    }

    fn begin(&mut self, count: u32) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| XystonError::illegal_state("mask writer not prepared"))?;
        state.expected = count;
        state.writer.write_u32(count)
    }

    fn write(&mut self, doc: DocId) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| XystonError::illegal_state("mask writer not prepared"))?;
        let delta = doc.wrapping_sub(state.previous);
        state.writer.write_varint(delta as u64)?;
        state.previous = doc;
        state.written += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| XystonError::illegal_state("mask writer not prepared"))?;
        if state.written != state.expected {
            return Err(XystonError::illegal_state(format!(
                "document mask wrote {} docs, announced {}",
                state.written, state.expected
            )));
        }
        state.writer.close()
    }
}

// ---------------------------------------------------------------------------
// postings
// ---------------------------------------------------------------------------

struct BasePostingsWriter;

impl PostingsWriter for BasePostingsWriter {
    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        fields: &[FieldPostings],
    ) -> Result<Vec<String>> {
        let mut files = Vec::new();

        let has_positions = fields
            .iter()
            .any(|f| f.features.positions || f.features.offsets);
        let has_payloads = fields.iter().any(|f| f.features.payloads);

        // doc-list shard: fields, terms and doc/freq runs
        let doc_file = postings_doc_file_name(segment);
        let mut doc_writer = StructWriter::new(storage.create_output(&doc_file)?);
        doc_writer.write_varint(fields.len() as u64)?;
        for field in fields {
            doc_writer.write_string(&field.name)?;
            doc_writer.write_u8(encode_features(&field.features))?;
            doc_writer.write_varint(field.terms.len() as u64)?;
            for (term, docs) in &field.terms {
                doc_writer.write_bytes(term)?;
                doc_writer.write_varint(docs.len() as u64)?;
                let mut previous = 0u32;
                for entry in docs {
                    doc_writer.write_varint(entry.doc.wrapping_sub(previous) as u64)?;
                    doc_writer.write_varint(entry.positions.len() as u64)?;
                    previous = entry.doc;
                }
            }
        }
        doc_writer.close()?;
        files.push(doc_file);

        // position shard: occurrence positions and offsets in doc-list order
        if has_positions {
            let pos_file = postings_pos_file_name(segment);
            let mut pos_writer = StructWriter::new(storage.create_output(&pos_file)?);
            for field in fields {
                if !(field.features.positions || field.features.offsets) {
                    continue;
                }
                for docs in field.terms.values() {
                    for entry in docs {
                        for occurrence in &entry.positions {
                            pos_writer.write_varint(occurrence.position as u64)?;
                            if field.features.offsets {
                                let (start, end) = occurrence.offset.unwrap_or((0, 0));
                                pos_writer.write_varint(start as u64)?;
                                pos_writer.write_varint(end as u64)?;
                            }
                        }
                    }
                }
            }
            pos_writer.close()?;
            files.push(pos_file);
        }

        // payload shard: per-occurrence payloads in doc-list order
        if has_payloads {
            let pay_file = postings_pay_file_name(segment);
            let mut pay_writer = StructWriter::new(storage.create_output(&pay_file)?);
            for field in fields {
                if !field.features.payloads {
                    continue;
                }
                for docs in field.terms.values() {
                    for entry in docs {
                        for occurrence in &entry.positions {
                            match &occurrence.payload {
                                Some(payload) => {
                                    pay_writer.write_u8(1)?;
                                    pay_writer.write_bytes(payload)?;
                                }
                                None => pay_writer.write_u8(0)?,
                            }
                        }
                    }
                }
            }
            pay_writer.close()?;
            files.push(pay_file);
        }

        Ok(files)
    }
}

struct BasePostingsReader;

impl PostingsReader for BasePostingsReader {
    fn read(&self, storage: &dyn Storage, segment: &str) -> Result<Vec<FieldPostings>> {
        let doc_file = postings_doc_file_name(segment);
        let mut doc_reader = StructReader::new(storage.open_input(&doc_file)?)?;

        let field_count = doc_reader.read_varint()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = doc_reader.read_string()?;
            let features = decode_features(doc_reader.read_u8()?);
            let term_count = doc_reader.read_varint()? as usize;

            let mut field = FieldPostings {
                name,
                features,
                terms: Default::default(),
            };
            for _ in 0..term_count {
                let term = doc_reader.read_bytes()?;
                let doc_count = doc_reader.read_varint()? as usize;
                let mut docs = Vec::with_capacity(doc_count);
                let mut previous = 0u32;
                for _ in 0..doc_count {
                    let delta = doc_reader.read_varint()? as u32;
                    let freq = doc_reader.read_varint()? as usize;
                    previous = previous.wrapping_add(delta);
                    docs.push(PostingDoc {
                        doc: previous,
                        positions: vec![PostingPosition::default(); freq],
                    });
                }
                field.terms.insert(term, docs);
            }
            fields.push(field);
        }
        doc_reader.expect_checksum()?;

        // position shard, same iteration order as the writer
        let pos_file = postings_pos_file_name(segment);
        if storage.file_exists(&pos_file) {
            let mut pos_reader = StructReader::new(storage.open_input(&pos_file)?)?;
            for field in &mut fields {
                if !(field.features.positions || field.features.offsets) {
                    continue;
                }
                let with_offsets = field.features.offsets;
                for docs in field.terms.values_mut() {
                    for entry in docs {
                        for occurrence in &mut entry.positions {
                            occurrence.position = pos_reader.read_varint()? as u32;
                            if with_offsets {
                                let start = pos_reader.read_varint()? as u32;
                                let end = pos_reader.read_varint()? as u32;
                                occurrence.offset = Some((start, end));
                            }
                        }
                    }
                }
            }
            pos_reader.expect_checksum()?;
        }

        // payload shard
        let pay_file = postings_pay_file_name(segment);
        if storage.file_exists(&pay_file) {
            let mut pay_reader = StructReader::new(storage.open_input(&pay_file)?)?;
            for field in &mut fields {
                if !field.features.payloads {
                    continue;
                }
                for docs in field.terms.values_mut() {
                    for entry in docs {
                        for occurrence in &mut entry.positions {
                            if pay_reader.read_u8()? != 0 {
                                occurrence.payload = Some(pay_reader.read_bytes()?);
                            }
                        }
                    }
                }
            }
            pay_reader.expect_checksum()?;
        }

        Ok(fields)
    }
}

// ---------------------------------------------------------------------------
// columnstore
// ---------------------------------------------------------------------------

struct BaseColumnstoreWriter;

impl ColumnstoreWriter for BaseColumnstoreWriter {
    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        columns: &[ColumnData],
    ) -> Result<Option<String>> {
        if columns.is_empty() {
            return Ok(None);
        }

        let filename = columnstore_file_name(segment);
        let mut writer = StructWriter::new(storage.create_output(&filename)?);
        writer.write_varint(columns.len() as u64)?;
        for column in columns {
            writer.write_string(&column.name)?;
            writer.write_varint(column.entries.len() as u64)?;
            let mut previous = 0u32;
            for (doc, values) in &column.entries {
                writer.write_varint(doc.wrapping_sub(previous) as u64)?;
                writer.write_varint(values.len() as u64)?;
                for value in values {
                    writer.write_bytes(value)?;
                }
                previous = *doc;
            }
        }
        writer.close()?;
        Ok(Some(filename))
    }
}

struct BaseColumnstoreReader;

impl ColumnstoreReader for BaseColumnstoreReader {
    fn read(&self, storage: &dyn Storage, segment: &str) -> Result<Vec<ColumnData>> {
        let filename = columnstore_file_name(segment);
        if !storage.file_exists(&filename) {
            return Ok(Vec::new());
        }

        let mut reader = StructReader::new(storage.open_input(&filename)?)?;
        let column_count = reader.read_varint()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let name = reader.read_string()?;
            let entry_count = reader.read_varint()? as usize;
            let mut entries = Vec::with_capacity(entry_count);
            let mut previous = 0u32;
            for _ in 0..entry_count {
                let delta = reader.read_varint()? as u32;
                previous = previous.wrapping_add(delta);
                let value_count = reader.read_varint()? as usize;
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(reader.read_bytes()?);
                }
                entries.push((previous, values));
            }
            columns.push(ColumnData { name, entries });
        }
        reader.expect_checksum()?;
        Ok(columns)
    }
}
