//! Access-unit assembly from copy and replacement cells.
//!
//! Every parsed access unit is described as an ordered list of *cells*, each
//! either a byte range of the source file or a replacement synthesized at
//! script-emission time (a rewritten Extension Substream header, or XLL
//! payload re-sliced by PBR smoothing). On finalization, physically
//! contiguous copy cells are merged and the frame becomes one PES record in
//! the output script.

use std::io::Write;

use anyhow::{Result, bail};

use crate::dts::extss::ExtSSHeader;
use crate::dts::patcher;
use crate::dts::xll::XllFrameSourcePosition;
use crate::script::{PesCommand, ScriptWriter};
use crate::utils::errors::FrameError;

/// Inner content type of one access unit cell.
///
/// Base frames (DCA Core, AC-3 sync frames) use [`AuCellKind::CoreSS`];
/// extension frames (DCA Extension Substream, TrueHD access units) open
/// with an [`AuCellKind::ExtSSHeader`] cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuCellKind {
    CoreSS,
    ExtSSHeader,
    ExtSSAsset,
}

/// Synthesized content taking the place of a cell's source range.
#[derive(Clone, Debug)]
pub enum CellReplacement {
    /// Byte-exact Extension Substream header rebuilt from parameters.
    ExtSSHeader(Box<ExtSSHeader>),
    /// XLL asset payload collected from re-sliced source positions.
    ExtSSAsset(XllFrameSourcePosition),
}

/// One unit of the output access unit payload.
#[derive(Clone, Debug)]
pub struct AuCell {
    pub kind: AuCellKind,
    pub offset: u64,
    pub length: u32,
    pub skip: bool,
    pub replacement: Option<CellReplacement>,
}

impl AuCell {
    fn new(kind: AuCellKind) -> Self {
        Self {
            kind,
            offset: 0,
            length: 0,
            skip: false,
            replacement: None,
        }
    }
}

/// Content classification of a finalized access unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuContentType {
    Empty,
    CoreSS,
    ExtSS,
}

/// The access unit under construction.
#[derive(Debug, Default)]
pub struct AuFrame {
    cells: Vec<AuCell>,
    current: Option<AuCell>,
}

impl AuFrame {
    /// Opens a new cell. Only one cell may be under construction at a time.
    pub fn begin_cell(&mut self, kind: AuCellKind) -> Result<()> {
        if self.current.is_some() {
            bail!(FrameError::CellAlreadyOpen);
        }
        self.current = Some(AuCell::new(kind));
        Ok(())
    }

    fn current_mut(&mut self) -> Result<&mut AuCell> {
        match &mut self.current {
            Some(cell) => Ok(cell),
            None => bail!(FrameError::NoCellOpen),
        }
    }

    pub fn set_source_range(&mut self, offset: u64, length: u32) -> Result<()> {
        let cell = self.current_mut()?;
        cell.offset = offset;
        cell.length = length;
        Ok(())
    }

    pub fn set_length(&mut self, length: u32) -> Result<()> {
        self.current_mut()?.length = length;
        Ok(())
    }

    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        self.current_mut()?.offset = offset;
        Ok(())
    }

    /// Marks the current cell as replaced by synthesized content.
    pub fn replace_with(&mut self, replacement: CellReplacement) -> Result<()> {
        let cell = self.current_mut()?;
        if cell.replacement.is_some() {
            bail!(FrameError::ReplacementAlreadySet);
        }
        cell.replacement = Some(replacement);
        Ok(())
    }

    /// Appends the current cell to the access unit.
    pub fn commit_cell(&mut self) -> Result<()> {
        match self.current.take() {
            Some(cell) => {
                self.cells.push(cell);
                Ok(())
            }
            None => bail!(FrameError::NoCellOpen),
        }
    }

    /// Drops the current cell without appending it.
    pub fn discard_cell(&mut self) -> Result<()> {
        if self.current.take().is_none() {
            bail!(FrameError::NoCellOpen);
        }
        Ok(())
    }

    /// Drops every cell of the access unit under construction.
    pub fn discard_all(&mut self) {
        self.cells.clear();
        self.current = None;
    }

    /// Total payload size in bytes of the committed cells.
    pub fn size(&self) -> u32 {
        self.cells.iter().filter(|c| !c.skip).map(|c| c.length).sum()
    }

    pub fn content_type(&self) -> AuContentType {
        let mut core_present = false;
        for cell in &self.cells {
            match cell.kind {
                AuCellKind::CoreSS => core_present = true,
                AuCellKind::ExtSSHeader => return AuContentType::ExtSS,
                AuCellKind::ExtSSAsset => {}
            }
        }

        if core_present {
            AuContentType::CoreSS
        } else {
            AuContentType::Empty
        }
    }

    /// Merges adjacent non-replaced cells whose source ranges are
    /// physically contiguous, marking merged-out cells as skipped so cell
    /// indices stay stable.
    fn merge_contiguous_cells(&mut self) {
        let mut dest: Option<usize> = None;
        for i in 0..self.cells.len() {
            if self.cells[i].replacement.is_some() {
                // A replaced cell breaks the current contiguous region.
                dest = None;
                continue;
            }

            match dest {
                Some(d)
                    if self.cells[d].offset + self.cells[d].length as u64
                        == self.cells[i].offset =>
                {
                    self.cells[d].length += self.cells[i].length;
                    self.cells[i].skip = true;
                }
                _ => dest = Some(i),
            }
        }
    }

    /// Completes the access unit: merges cells, classifies the content and
    /// emits one PES record with the given 27 MHz timestamp.
    ///
    /// An access unit with no committed cell is reset silently.
    pub fn finalize<W: Write>(
        &mut self,
        script: &mut ScriptWriter<W>,
        src_file: u8,
        pts: u64,
    ) -> Result<()> {
        if self.current.is_some() {
            bail!(FrameError::IncompleteCell);
        }

        if self.cells.is_empty() {
            return Ok(());
        }

        self.merge_contiguous_cells();

        let extension_frame = match self.content_type() {
            AuContentType::CoreSS => false,
            AuContentType::ExtSS => true,
            AuContentType::Empty => bail!(FrameError::UnexpectedContent),
        };

        script.begin_pes(pts, extension_frame);

        let mut dst_offset = 0u32;
        for cell in self.cells.iter().filter(|c| !c.skip) {
            match &cell.replacement {
                Some(CellReplacement::ExtSSHeader(header)) => {
                    let bytes = patcher::build_ext_ss_header(header)?;
                    let written = bytes.len() as u32;
                    script.push_command(PesCommand::WriteLiteral {
                        dst_offset,
                        bytes,
                    });
                    dst_offset += written;
                }
                Some(CellReplacement::ExtSSAsset(position)) => {
                    for index in position.indexes() {
                        script.push_command(PesCommand::CopySource {
                            dst_offset,
                            src_file,
                            src_offset: index.offset as u64,
                            length: index.length,
                        });
                        dst_offset += index.length;
                    }
                }
                None => {
                    script.push_command(PesCommand::CopySource {
                        dst_offset,
                        src_file,
                        src_offset: cell.offset,
                        length: cell.length,
                    });
                    dst_offset += cell.length;
                }
            }
        }

        script.end_pes();

        self.cells.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_copy_cells_are_merged() -> Result<()> {
        let mut frame = AuFrame::default();

        frame.begin_cell(AuCellKind::ExtSSHeader)?;
        frame.set_source_range(0x100, 24)?;
        frame.commit_cell()?;

        frame.begin_cell(AuCellKind::ExtSSAsset)?;
        frame.set_source_range(0x118, 100)?;
        frame.commit_cell()?;

        frame.begin_cell(AuCellKind::ExtSSAsset)?;
        frame.set_source_range(0x200, 8)?;
        frame.commit_cell()?;

        let mut script = ScriptWriter::new(Vec::new());
        let src = script.add_source_file("test.dts");
        frame.finalize(&mut script, src, 0)?;

        assert_eq!(script.nb_records(), 1);
        Ok(())
    }

    #[test]
    fn double_begin_is_rejected() -> Result<()> {
        let mut frame = AuFrame::default();
        frame.begin_cell(AuCellKind::CoreSS)?;
        assert!(frame.begin_cell(AuCellKind::CoreSS).is_err());
        Ok(())
    }

    #[test]
    fn empty_frame_resets_silently() -> Result<()> {
        let mut frame = AuFrame::default();
        let mut script = ScriptWriter::new(Vec::new());
        frame.finalize(&mut script, 0, 0)?;
        assert_eq!(script.nb_records(), 0);
        Ok(())
    }

    #[test]
    fn discarded_cell_leaves_frame_empty() -> Result<()> {
        let mut frame = AuFrame::default();
        frame.begin_cell(AuCellKind::CoreSS)?;
        frame.set_source_range(0, 2048)?;
        frame.discard_cell()?;
        assert_eq!(frame.size(), 0);
        assert_eq!(frame.content_type(), AuContentType::Empty);
        Ok(())
    }
}
