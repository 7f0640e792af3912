//! WAL file observation and frame mining.
//!
//! The observer tracks the last processed byte offset (always on a frame
//! boundary) plus the WAL header salts. Each pass reads the complete,
//! committed frames appended since the previous pass; a salt change or a
//! shrunken file means the WAL was checkpointed and restarted, and the
//! offset resets to the post-header position.
//!
//! Frame payloads are mined for table leaf pages only. Interior table pages
//! are used to attribute child pages to their owning table after a B-tree
//! split; index pages and overflow chains are never interpreted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::codec::{self, CellPayload};
use crate::error::{Error, Result};
use crate::schema::SchemaResolver;
use crate::value::Row;

/// Size of the WAL file header.
pub(crate) const WAL_HEADER_SIZE: u64 = 32;
/// Size of the per-frame header.
pub(crate) const FRAME_HEADER_SIZE: u64 = 24;

const WAL_MAGIC_LE: u32 = 0x377F_0682;
const WAL_MAGIC_BE: u32 = 0x377F_0683;

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parsed 32-byte WAL header.
#[derive(Debug, Clone, Copy)]
struct WalHeader {
    page_size: u32,
    salts: (u32, u32),
}

impl WalHeader {
    fn parse(buf: &[u8]) -> Result<WalHeader> {
        if buf.len() < WAL_HEADER_SIZE as usize {
            return Err(Error::WalParse("WAL file too small for header".into()));
        }
        let magic = be_u32(buf, 0);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(Error::WalParse(format!("invalid WAL magic {magic:#010x}")));
        }
        let raw_page_size = be_u32(buf, 8);
        // A stored value of 1 means 65536.
        let page_size = if raw_page_size == 1 { 65536 } else { raw_page_size };
        Ok(WalHeader {
            page_size,
            salts: (be_u32(buf, 16), be_u32(buf, 20)),
        })
    }
}

/// Parsed 24-byte frame header.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    page_no: u32,
    /// Database size in pages; non-zero only on commit frames.
    db_size: u32,
    salts: (u32, u32),
}

impl FrameHeader {
    fn parse(buf: &[u8]) -> FrameHeader {
        FrameHeader {
            page_no: be_u32(buf, 0),
            db_size: be_u32(buf, 4),
            salts: (be_u32(buf, 8), be_u32(buf, 12)),
        }
    }
}

/// One page image extracted from a committed WAL frame.
pub(crate) struct PageImage {
    pub page_no: u32,
    pub data: Vec<u8>,
}

/// Tracks WAL growth and yields newly committed page images.
pub(crate) struct WalObserver {
    path: PathBuf,
    page_size: u32,
    offset: u64,
    salts: Option<(u32, u32)>,
}

impl WalObserver {
    pub fn new(path: PathBuf, page_size: u32) -> WalObserver {
        WalObserver {
            path,
            page_size,
            offset: WAL_HEADER_SIZE,
            salts: None,
        }
    }

    fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE + u64::from(self.page_size)
    }

    /// Move the offset to the current end of the WAL so pre-existing frames
    /// (already reflected in cache loads) are not replayed.
    pub fn seek_to_end(&mut self) -> Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE {
            return Ok(());
        }
        let mut header = [0u8; WAL_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let header = WalHeader::parse(&header)?;
        self.salts = Some(header.salts);
        let frames = (len - WAL_HEADER_SIZE) / self.frame_size();
        self.offset = WAL_HEADER_SIZE + frames * self.frame_size();
        debug!(offset = self.offset, "WAL observer initialized");
        Ok(())
    }

    /// Read all complete frames appended since the last pass, up to and
    /// including the last commit frame. Frames of an uncommitted transaction
    /// stay unconsumed until a later pass; stale frames whose salts predate
    /// the current WAL header end the pass.
    pub fn read_new_frames(&mut self) -> Result<Vec<PageImage>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE {
            // Truncated to nothing: a restarted WAL will bring new salts.
            self.offset = WAL_HEADER_SIZE;
            self.salts = None;
            return Ok(Vec::new());
        }

        let mut header_buf = [0u8; WAL_HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)?;
        let header = WalHeader::parse(&header_buf)?;
        if header.page_size != self.page_size {
            return Err(Error::WalParse(format!(
                "WAL page size {} does not match database page size {}",
                header.page_size, self.page_size
            )));
        }
        if self.salts != Some(header.salts) || len < self.offset {
            if self.salts.is_some() {
                debug!("WAL was reset by a checkpoint, rewinding to header");
            }
            self.offset = WAL_HEADER_SIZE;
            self.salts = Some(header.salts);
        }

        let frame_size = self.frame_size();
        let complete = (len - self.offset) / frame_size;
        if complete == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; (complete * frame_size) as usize];
        file.seek(SeekFrom::Start(self.offset))?;
        file.read_exact(&mut buf)?;

        let mut images = Vec::new();
        let mut last_commit = None;
        for index in 0..complete as usize {
            let at = index * frame_size as usize;
            let frame_header = FrameHeader::parse(&buf[at..]);
            if frame_header.salts != header.salts {
                // Leftover frames from before the last WAL reset.
                break;
            }
            if frame_header.db_size != 0 {
                last_commit = Some(index);
            }
            images.push(PageImage {
                page_no: frame_header.page_no,
                data: buf[at + FRAME_HEADER_SIZE as usize..at + frame_size as usize].to_vec(),
            });
        }

        let Some(last_commit) = last_commit else {
            return Ok(Vec::new());
        };
        images.truncate(last_commit + 1);
        self.offset += (last_commit as u64 + 1) * frame_size;
        debug!(
            frames = images.len(),
            offset = self.offset,
            "consumed committed WAL frames"
        );
        Ok(images)
    }
}

/// A decoded row image from a leaf cell.
pub(crate) enum RowImage {
    Decoded(Row),
    /// The cell could not be trusted (overflow payload or a decode
    /// failure); the row must be re-read from the live database.
    NeedsRefetch,
}

/// One row-level change mined from a frame batch, in frame order then
/// cell-pointer order.
pub(crate) struct RowChange {
    pub table: String,
    pub rowid: i64,
    pub image: RowImage,
    pub page: u32,
}

/// Per-table evidence collected from one frame batch, feeding deletion
/// inference.
#[derive(Default)]
pub(crate) struct TableTouch {
    pub pages: BTreeSet<u32>,
    pub seen_rowids: BTreeSet<i64>,
}

/// Result of mining one batch of committed frames.
pub(crate) struct FrameBatch {
    pub changes: Vec<RowChange>,
    pub touched: BTreeMap<String, TableTouch>,
    /// Leaf table pages that could not be attributed to a tracked table
    /// were present; deletion inference must verify against the live
    /// database instead of trusting page absence.
    pub ambiguous: bool,
    /// Per-page decode failures. The batch stays usable.
    pub errors: Vec<Error>,
}

/// Mine a batch of page images into row changes.
pub(crate) fn decode_frames(
    frames: &[PageImage],
    resolver: &mut SchemaResolver,
    page_size: u32,
) -> FrameBatch {
    let mut batch = FrameBatch {
        changes: Vec::new(),
        touched: BTreeMap::new(),
        ambiguous: false,
        errors: Vec::new(),
    };

    // Attribute pages from interior nodes first, iterating to a fixpoint:
    // a split may introduce an interior page whose own attribution arrives
    // from another frame of the same batch.
    loop {
        let mut grew = false;
        for frame in frames {
            if frame.data.first() != Some(&codec::INTERIOR_TABLE_PAGE) {
                continue;
            }
            let Some(table) = resolver.table_for_page(frame.page_no).map(str::to_owned) else {
                continue;
            };
            match codec::interior_children(&frame.data) {
                Ok(children) => {
                    for child in children {
                        grew |= resolver.attribute_page(child, &table);
                    }
                }
                Err(e) => batch.errors.push(e),
            }
        }
        if !grew {
            break;
        }
    }

    for frame in frames {
        if frame.data.first() != Some(&codec::LEAF_TABLE_PAGE) {
            continue;
        }
        let Some(table) = resolver.table_for_page(frame.page_no).map(str::to_owned) else {
            // A leaf table page we cannot attribute: possibly an untracked
            // table, possibly a split we have not mapped. Either way the
            // batch loses page-absence certainty.
            batch.ambiguous = true;
            continue;
        };
        let Some(schema) = resolver.table(&table) else {
            continue;
        };

        let touch = batch.touched.entry(table.clone()).or_default();
        touch.pages.insert(frame.page_no);

        let cells = match codec::leaf_cells(&frame.data, page_size) {
            Ok(cells) => cells,
            Err(e) => {
                warn!(page = frame.page_no, error = %e, "skipping undecodable leaf page");
                batch.errors.push(e);
                batch.ambiguous = true;
                continue;
            }
        };
        for cell in cells {
            touch.seen_rowids.insert(cell.rowid);
            let image = match cell.payload {
                CellPayload::Local(range) => {
                    match schema.decode_record(cell.rowid, &frame.data[range]) {
                        Ok(row) => RowImage::Decoded(row),
                        Err(e) => {
                            batch.errors.push(e);
                            RowImage::NeedsRefetch
                        }
                    }
                }
                CellPayload::Overflow { payload_size } => {
                    debug!(
                        table = %table,
                        rowid = cell.rowid,
                        payload_size,
                        "payload spills to overflow pages, re-reading row"
                    );
                    RowImage::NeedsRefetch
                }
            };
            batch.changes.push(RowChange {
                table: table.clone(),
                rowid: cell.rowid,
                image,
                page: frame.page_no,
            });
        }
    }

    batch
}
