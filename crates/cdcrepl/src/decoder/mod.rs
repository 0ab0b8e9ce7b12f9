//! MariaDB binlog event decoder
//!
//! Turns [`RawEvent`]s into [`DecodedItem`]s:
//! - MARIADB_GTID_EVENT opens an event group (`Begin`)
//! - TABLE_MAP_EVENT is remembered per connection, keyed by table id
//! - WRITE/UPDATE/DELETE_ROWS (v1 and v2) become row change records
//! - XID_EVENT and `COMMIT` close the group (`TransactionBoundary`)
//! - QUERY_EVENT DDL invalidates the affected cached schema
//! - QUERY_EVENT DML (statement or mixed binlog format) is rejected
//! - FORMAT_DESCRIPTION_EVENT selects CRC32 verification
//!
//! Decoding performs no I/O. Row layouts come from the [`SchemaCache`]; a
//! table missing from the cache yields [`DecodeError::UnknownTable`] without
//! touching decoder state, so the same event can be decoded again once the
//! caller has fetched the schema.

mod reader;
pub mod value;

use crate::error::DecodeError;
use crate::event::{event_type, EventHeader, RawEvent};
use crate::filter::TableFilter;
use crate::position::Gtid;
use crate::record::RowChangeRecord;
use crate::schema::{SchemaCache, TableRef, TableSchema};
use reader::{is_bit_set, ByteReader};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, trace};
use value::{decode_value, ColumnType, ColumnValue};

/// GTID event flag: the group is a single statement without BEGIN/COMMIT.
const FL_STANDALONE: u8 = 0x01;
/// Fixed part of the FORMAT_DESCRIPTION body before the post-header lengths.
const FDE_FIXED_LEN: usize = 2 + 50 + 4 + 1;
const CRC_LEN: usize = 4;

static DDL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*(?:/\*.*?\*/\s*)*(?:CREATE|ALTER|DROP|RENAME|TRUNCATE)\b(?:\s+(?:OR\s+REPLACE|TEMPORARY|ONLINE|OFFLINE|IGNORE))*\s+(TABLE\b)?(?:\s+IF\s+(?:NOT\s+)?EXISTS)?\s*(?:(`[^`]+`|[\w$]+)(?:\s*\.\s*(`[^`]+`|[\w$]+))?)?",
    )
    .expect("DDL regex is valid")
});

/// Statements that change no table data and may appear in a row-based binlog.
static ADMIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*(?:/\*.*?\*/\s*)*(?:SAVEPOINT|RELEASE\s+SAVEPOINT|ROLLBACK\s+(?:WORK\s+)?TO|GRANT|REVOKE|SET\s+PASSWORD|FLUSH|ANALYZE|OPTIMIZE|REPAIR|INSTALL|UNINSTALL)\b",
    )
    .expect("admin regex is valid")
});

/// Output of [`BinlogDecoder::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedItem {
    /// An event group starts
    Begin { gtid: Gtid, standalone: bool },
    /// Row changes in event order
    Rows(Vec<RowChangeRecord>),
    /// The open group committed
    TransactionBoundary(Gtid),
    /// The open group rolled back
    Rollback,
    /// DDL; `table` is `None` for statements not naming a single table.
    /// `commit` is set when the statement was a standalone group and thereby
    /// also closes it.
    SchemaChange {
        table: Option<TableRef>,
        commit: Option<Gtid>,
    },
    Heartbeat,
    /// Bookkeeping events with nothing to deliver
    Ignored,
}

/// TABLE_MAP contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMap {
    pub table_id: u64,
    pub table: TableRef,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMap {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlg {
    #[default]
    None,
    Crc32,
}

#[derive(Debug, Clone, Copy)]
enum RowsKind {
    Insert,
    Update,
    Delete,
}

/// Per-connection binlog decoder.
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    tables: HashMap<u64, TableMap>,
    checksum: ChecksumAlg,
    open: Option<(Gtid, bool)>,
    filter: TableFilter,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows for tables the filter rejects decode to [`DecodedItem::Ignored`].
    pub fn with_filter(filter: TableFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn checksum(&self) -> ChecksumAlg {
        self.checksum
    }

    pub fn table_map(&self, table_id: u64) -> Option<&TableMap> {
        self.tables.get(&table_id)
    }

    /// GTID of the group currently open on the stream.
    pub fn open_gtid(&self) -> Option<Gtid> {
        self.open.map(|(gtid, _)| gtid)
    }

    pub fn decode(
        &mut self,
        raw: &RawEvent,
        schemas: &mut SchemaCache,
    ) -> Result<DecodedItem, DecodeError> {
        let data = raw.data.as_ref();
        let header = EventHeader::parse(data).ok_or(DecodeError::Truncated("event header"))?;

        if header.type_code == event_type::FORMAT_DESCRIPTION {
            self.checksum = detect_checksum(data)?;
            debug!(checksum = ?self.checksum, "Format description");
            return Ok(DecodedItem::Ignored);
        }

        let payload = self.payload(&header, data)?;
        trace!(
            type_code = header.type_code,
            len = data.len(),
            "Decoding event"
        );

        match header.type_code {
            event_type::MARIADB_GTID => self.decode_gtid(&header, payload),
            event_type::XID => match self.open.take() {
                Some((gtid, _)) => Ok(DecodedItem::TransactionBoundary(gtid)),
                None => Err(DecodeError::malformed("XID event outside an event group")),
            },
            event_type::QUERY => self.decode_query(payload, schemas),
            event_type::TABLE_MAP => {
                let map = decode_table_map(payload)?;
                trace!(table_id = map.table_id, table = %map.table, "Table map");
                self.tables.insert(map.table_id, map);
                Ok(DecodedItem::Ignored)
            }
            event_type::WRITE_ROWS_V1 | event_type::WRITE_ROWS_V2 => {
                self.decode_rows(header.type_code, RowsKind::Insert, payload, schemas)
            }
            event_type::UPDATE_ROWS_V1 | event_type::UPDATE_ROWS_V2 => {
                self.decode_rows(header.type_code, RowsKind::Update, payload, schemas)
            }
            event_type::DELETE_ROWS_V1 | event_type::DELETE_ROWS_V2 => {
                self.decode_rows(header.type_code, RowsKind::Delete, payload, schemas)
            }
            event_type::HEARTBEAT => Ok(DecodedItem::Heartbeat),
            event_type::QUERY_COMPRESSED
            | event_type::WRITE_ROWS_COMPRESSED_V1..=event_type::DELETE_ROWS_COMPRESSED => {
                Err(DecodeError::unsupported(format!(
                    "compressed binlog event type {} (disable log_bin_compress)",
                    header.type_code
                )))
            }
            _ => Ok(DecodedItem::Ignored),
        }
    }

    /// Event body with the checksum trailer verified and stripped.
    fn payload<'a>(&self, header: &EventHeader, data: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        if self.checksum == ChecksumAlg::None {
            return Ok(&data[EventHeader::SIZE..]);
        }
        if data.len() < EventHeader::SIZE + CRC_LEN {
            return Err(DecodeError::Truncated("checksum trailer"));
        }
        let (body, trailer) = data.split_at(data.len() - CRC_LEN);
        if header.type_code != event_type::HEARTBEAT {
            verify_crc(body, trailer)?;
        }
        Ok(&body[EventHeader::SIZE..])
    }

    fn decode_gtid(
        &mut self,
        header: &EventHeader,
        payload: &[u8],
    ) -> Result<DecodedItem, DecodeError> {
        let mut r = ByteReader::new(payload, "GTID event");
        let sequence = r.u64_le()?;
        let domain = r.u32_le()?;
        let flags = r.u8()?;
        let gtid = Gtid::new(domain, header.server_id, sequence);
        let standalone = flags & FL_STANDALONE != 0;
        self.open = Some((gtid, standalone));
        Ok(DecodedItem::Begin { gtid, standalone })
    }

    fn decode_query(
        &mut self,
        payload: &[u8],
        schemas: &mut SchemaCache,
    ) -> Result<DecodedItem, DecodeError> {
        let mut r = ByteReader::new(payload, "query event");
        let _thread_id = r.u32_le()?;
        let _exec_time = r.u32_le()?;
        let db_len = r.u8()? as usize;
        let _error_code = r.u16_le()?;
        let status_len = r.u16_le()? as usize;
        r.skip(status_len)?;
        let database = String::from_utf8_lossy(r.take(db_len)?).into_owned();
        r.skip(1)?;
        let sql = String::from_utf8_lossy(r.rest());
        let statement = sql.trim();

        if statement.eq_ignore_ascii_case("BEGIN") {
            return Ok(DecodedItem::Ignored);
        }
        if statement.eq_ignore_ascii_case("COMMIT") {
            return match self.open.take() {
                Some((gtid, _)) => Ok(DecodedItem::TransactionBoundary(gtid)),
                None => Err(DecodeError::malformed("COMMIT outside an event group")),
            };
        }
        if statement.eq_ignore_ascii_case("ROLLBACK") {
            self.open = None;
            return Ok(DecodedItem::Rollback);
        }

        let ddl = parse_ddl(statement, &database);
        if ddl.is_none() && !ADMIN_REGEX.is_match(statement) {
            let group = self
                .open
                .map(|(gtid, _)| gtid.to_string())
                .unwrap_or_else(|| "no event group".to_string());
            let verb = statement.split_whitespace().next().unwrap_or_default();
            return Err(DecodeError::unsupported(format!(
                "{} logged as a statement in {}; the source must use binlog_format=ROW",
                verb, group
            )));
        }

        let commit = match self.open {
            Some((gtid, true)) => {
                self.open = None;
                Some(gtid)
            }
            _ => None,
        };

        match ddl {
            Some(table) => {
                match &table {
                    Some(t) => {
                        schemas.invalidate(t);
                    }
                    None => schemas.clear(),
                }
                debug!(table = ?table, "Schema change");
                Ok(DecodedItem::SchemaChange { table, commit })
            }
            None => Ok(match commit {
                Some(gtid) => DecodedItem::TransactionBoundary(gtid),
                None => DecodedItem::Ignored,
            }),
        }
    }

    fn decode_rows(
        &self,
        type_code: u8,
        kind: RowsKind,
        payload: &[u8],
        schemas: &mut SchemaCache,
    ) -> Result<DecodedItem, DecodeError> {
        let mut r = ByteReader::new(payload, "rows event");
        let table_id = r.uint_le(6)?;
        let _flags = r.u16_le()?;
        if type_code >= event_type::WRITE_ROWS_V2 {
            // extra_len counts its own two bytes
            let extra_len = r.u16_le()? as usize;
            r.skip(extra_len.saturating_sub(2))?;
        }
        let column_count = r.packed_int()? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let present = r.take(bitmap_len)?;
        let present_after = match kind {
            RowsKind::Update => Some(r.take(bitmap_len)?),
            _ => None,
        };

        let map = self
            .tables
            .get(&table_id)
            .ok_or(DecodeError::MissingTableMap(table_id))?;
        if !self.filter.accepts(&map.table.database, &map.table.table) {
            return Ok(DecodedItem::Ignored);
        }
        if map.column_count() != column_count {
            return Err(DecodeError::malformed(format!(
                "rows event for {} has {} columns, table map has {}",
                map.table,
                column_count,
                map.column_count()
            )));
        }

        let cached = match schemas.get(&map.table) {
            Some(schema) => schema.column_count(),
            None => return Err(DecodeError::UnknownTable(map.table.clone())),
        };
        if cached != column_count {
            schemas.invalidate(&map.table);
            return Err(DecodeError::SchemaDrift {
                table: map.table.clone(),
                cached,
                event: column_count,
            });
        }
        let schema = schemas
            .get(&map.table)
            .ok_or_else(|| DecodeError::UnknownTable(map.table.clone()))?;

        let full_image = |bitmap: &[u8]| (0..column_count).all(|i| is_bit_set(bitmap, i));
        if !full_image(present) || !present_after.map_or(true, full_image) {
            return Err(DecodeError::unsupported(format!(
                "partial row image for {} (binlog_row_image=FULL is required)",
                map.table
            )));
        }

        let mut records = Vec::new();
        while r.has_remaining() {
            let table = map.table.clone();
            let record = match kind {
                RowsKind::Insert => RowChangeRecord::insert(table, read_image(&mut r, map, schema)?),
                RowsKind::Delete => RowChangeRecord::delete(table, read_image(&mut r, map, schema)?),
                RowsKind::Update => {
                    let before = read_image(&mut r, map, schema)?;
                    let after = read_image(&mut r, map, schema)?;
                    RowChangeRecord::update(table, before, after)
                }
            };
            records.push(record);
        }
        trace!(table = %map.table, rows = records.len(), "Rows event");
        Ok(DecodedItem::Rows(records))
    }
}

/// One full row image: NULL bitmap followed by the non-NULL values.
fn read_image(
    r: &mut ByteReader<'_>,
    map: &TableMap,
    schema: &TableSchema,
) -> Result<Vec<ColumnValue>, DecodeError> {
    let n = map.column_count();
    let nulls = r.take(n.div_ceil(8))?;
    let mut values = Vec::with_capacity(n);
    for (i, column) in schema.columns.iter().enumerate() {
        if is_bit_set(nulls, i) {
            values.push(ColumnValue::Null);
        } else {
            values.push(decode_value(
                r,
                map.column_types[i],
                map.column_metadata[i],
                column,
            )?);
        }
    }
    Ok(values)
}

fn decode_table_map(payload: &[u8]) -> Result<TableMap, DecodeError> {
    let mut r = ByteReader::new(payload, "table map event");
    let table_id = r.uint_le(6)?;
    let _flags = r.u16_le()?;
    let database = r.short_name()?;
    let table = r.short_name()?;
    let column_count = r.packed_int()? as usize;

    let column_types = r
        .take(column_count)?
        .iter()
        .map(|code| {
            ColumnType::from_u8(*code).ok_or_else(|| {
                DecodeError::unsupported(format!("column type code {code} in {database}.{table}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let metadata_len = r.packed_int()? as usize;
    let mut meta = ByteReader::new(r.take(metadata_len)?, "table map metadata");
    let column_metadata = column_types
        .iter()
        .map(|t| t.read_metadata(&mut meta))
        .collect::<Result<Vec<_>, _>>()?;

    let null_bitmap = r.take(column_count.div_ceil(8))?.to_vec();

    Ok(TableMap {
        table_id,
        table: TableRef::new(database, table),
        column_types,
        column_metadata,
        null_bitmap,
    })
}

fn verify_crc(body: &[u8], trailer: &[u8]) -> Result<(), DecodeError> {
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(body);
    if expected != computed {
        return Err(DecodeError::Checksum { expected, computed });
    }
    Ok(())
}

/// The checksum algorithm byte sits just before the CRC32 trailer when
/// checksums are on, and is the last byte otherwise.
fn detect_checksum(data: &[u8]) -> Result<ChecksumAlg, DecodeError> {
    if data.len() < EventHeader::SIZE + FDE_FIXED_LEN + 1 {
        return Err(DecodeError::Truncated("format description event"));
    }
    if data.len() >= EventHeader::SIZE + FDE_FIXED_LEN + 1 + CRC_LEN
        && data[data.len() - CRC_LEN - 1] == 1
    {
        let (body, trailer) = data.split_at(data.len() - CRC_LEN);
        verify_crc(body, trailer)?;
        return Ok(ChecksumAlg::Crc32);
    }
    Ok(ChecksumAlg::None)
}

fn unquote(ident: &str) -> String {
    ident.trim_matches('`').to_string()
}

/// `Some(Some(table))` for table DDL, `Some(None)` for other DDL, `None` for
/// anything else.
fn parse_ddl(statement: &str, default_db: &str) -> Option<Option<TableRef>> {
    let caps = DDL_REGEX.captures(statement)?;
    let (Some(_), Some(first)) = (caps.get(1), caps.get(2)) else {
        return Some(None);
    };
    let first = unquote(first.as_str());
    Some(Some(match caps.get(3) {
        Some(second) => TableRef::new(first, unquote(second.as_str())),
        None => TableRef::new(default_db, first),
    }))
}
