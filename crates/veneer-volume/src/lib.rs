#![forbid(unsafe_code)]
//! The target-volume contract and its orchestration.
//!
//! A `Volume` lays out one filesystem over the source tree using two
//! planners: metadata generated on the fly goes to the temporary planner
//! and is re-exposed on the output planner via `wrap_to_go`; file payload
//! is referenced by extent and never copied. A hybrid pair shares the file
//! area: the master owns the layout and delegates its reserved and trailing
//! regions to the slave.

use tracing::{debug, info};
use veneer_burn::{Burner, Planner};
use veneer_error::{Result, VeneerError};
use veneer_extent::Extent;
use veneer_geometry::Colonies;
use veneer_source::Original;
use veneer_types::MAPPER_SECTOR;

pub mod mbr;

/// Fallback block size when neither medium states a preference.
const PAGE_SIZE: i64 = 4096;

/// A slave filesystem co-describing the master's file area.
pub trait Hybrid {
    /// Desired minimal block size, or 0 for no preference.
    fn blk_sz_hint(&mut self, _tree: &Original, _out_block: i64, _tmp_block: i64) -> i64 {
        0
    }

    /// The master has fixed the block size and merged the tree; the
    /// source-to-target mapping is now fully defined.
    fn master_adjusted(
        &mut self,
        tree: &Original,
        out_block: i64,
        tmp_block: i64,
        block: i64,
    ) -> Result<()>;

    /// The master reserves a leading range and delegates filling it in.
    /// At most `cap` bytes may be appended.
    fn master_reserved(
        &mut self,
        tree: &Original,
        out: &mut Planner,
        tmp: &mut Planner,
        cap: i64,
    ) -> Result<()>;

    /// The master is done with the file area and its own metadata; the
    /// slave may append freely.
    fn master_complete(
        &mut self,
        tree: &Original,
        out: &mut Planner,
        tmp: &mut Planner,
        colonies: &Colonies,
    ) -> Result<()>;
}

/// A generic target filesystem volume.
pub trait Volume {
    /// Bitwise-OR mask of the logical block/cluster sizes the format
    /// admits.
    fn size_range(&self) -> i64;

    /// Currently chosen block size; 0 when not yet decided.
    fn block_size(&self) -> i64;

    fn set_block_size(&mut self, block: i64);

    /// Set the originating-system and volume labels, assuming sanitized
    /// inputs.
    fn set_labels(&mut self, system: &str, volume: &str);

    /// Sanitize raw titles to identifier characters, then apply them.
    fn set_titles(&mut self, system: &str, volume: &str) {
        let system = veneer_name::sanitize_d(system);
        let volume = veneer_name::sanitize_d(volume);
        self.set_labels(&system, &volume);
    }

    /// Space accounting hints: `scratch` marks a mostly-free writable
    /// partition, `scrooge` claims every gap, `extra` reserves free room
    /// beyond the projected files.
    fn book_space(&mut self, _scratch: bool, _scrooge: bool, _extra: i64) {}

    /// Lay out the volume, appending extents to the planners. Returns the
    /// source-to-target translation of the file area.
    fn plan(&mut self, tree: &Original, out: &mut Planner, tmp: &mut Planner) -> Result<Colonies>;

    /// The attached hybrid slave, if any.
    fn hybrid_mut(&mut self) -> Option<&mut (dyn Hybrid + 'static)> {
        None
    }
}

/// Choose the block size: the largest supported block that divides the
/// source granularity and suits the media, falling back to the page size,
/// then to the mapper sector.
pub fn adjust_block_size(
    volume: &mut (impl Volume + ?Sized),
    tree: &Original,
    out_block: i64,
    tmp_block: i64,
    hint: i64,
) -> Result<()> {
    let in_mask = tree.geometry.granularity(MAPPER_SECTOR)?;
    let fs_mask = volume.size_range();
    let mask = in_mask & fs_mask;
    if mask == 0 {
        return Err(VeneerError::Granularity {
            tree: in_mask,
            fs: fs_mask,
        });
    }

    let mut want = volume.block_size();
    if want == 0 {
        want = hint;
    }
    if want == 0 {
        want = out_block.max(tmp_block);
    }
    if want == 0 {
        want = PAGE_SIZE;
    }
    want = want.max(MAPPER_SECTOR);

    let size = if want & mask != 0 {
        want
    } else if want > mask {
        mask & !(mask >> 1) // highest admissible
    } else {
        mask & !(mask << 1) // lowest admissible
    };
    debug!(
        target: "veneer::volume",
        granularity = format_args!("{in_mask:#x}"),
        fs_mask = format_args!("{fs_mask:#x}"),
        want,
        chosen = size,
        "block size adjusted"
    );
    volume.set_block_size(size);
    Ok(())
}

/// Fill a master-reserved leading range: let the slave write into it, then
/// zero-pad to `cap`. A slave overrunning its allowance is a plan bug.
pub fn plan_reserved(
    hybrid: Option<&mut (dyn Hybrid + 'static)>,
    tree: &Original,
    out: &mut Planner,
    tmp: &mut Planner,
    cap: i64,
) -> Result<()> {
    let start = out.offset();
    if let Some(slave) = hybrid {
        slave.master_reserved(tree, out, tmp, cap)?;
    }
    let used = out.offset() - start;
    if used < cap {
        out.append(Extent::zeroes(cap - used))?;
    } else if used > cap {
        return Err(VeneerError::assertion(format!(
            "reserved area breach: allowed {cap:#x}, written {used:#x}"
        )));
    }
    Ok(())
}

/// The workhorse: lay the source tree out on the output medium, using the
/// temporary medium for generated metadata, and flush both.
pub fn represent(
    volume: &mut dyn Volume,
    tree: &mut Original,
    out_image: Box<dyn Burner>,
    tmp_image: Box<dyn Burner>,
) -> Result<Colonies> {
    let out_block = out_image.block_size();
    let tmp_block = tmp_image.block_size();

    let hint = volume
        .hybrid_mut()
        .map(|slave| slave.blk_sz_hint(tree, out_block, tmp_block))
        .unwrap_or(0);
    adjust_block_size(volume, tree, out_block, tmp_block, hint)?;

    let block = volume.block_size();
    tree.geometry.optimize(block);
    if let Some(slave) = volume.hybrid_mut() {
        slave.master_adjusted(tree, out_block, tmp_block, block)?;
    }

    let mut out_planner = Planner::new(out_image);
    let mut tmp_planner = Planner::new(tmp_image);
    out_planner.request_block_size(block);

    let colonies = volume.plan(tree, &mut out_planner, &mut tmp_planner)?;
    if let Some(slave) = volume.hybrid_mut() {
        slave.master_complete(tree, &mut out_planner, &mut tmp_planner, &colonies)?;
    }

    // scratch first: the output extents reference the scratch medium
    tmp_planner.commit()?;
    out_planner.commit()?;
    info!(
        target: "veneer::volume",
        image_bytes = out_planner.offset(),
        block,
        "volume committed"
    );
    Ok(colonies)
}

/// The `files` mode: payload extents mapped linearly, no filesystem
/// metadata at all.
#[derive(Default)]
pub struct RawFilesOut {
    block: i64,
}

impl Volume for RawFilesOut {
    fn size_range(&self) -> i64 {
        i64::MAX & !(MAPPER_SECTOR - 1)
    }

    fn block_size(&self) -> i64 {
        self.block
    }

    fn set_block_size(&mut self, block: i64) {
        self.block = block;
    }

    fn set_labels(&mut self, _system: &str, _volume: &str) {}

    fn plan(&mut self, tree: &Original, out: &mut Planner, _tmp: &mut Planner) -> Result<Colonies> {
        tree.geometry.write_files(out)
    }
}
