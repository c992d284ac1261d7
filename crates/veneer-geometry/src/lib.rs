#![forbid(unsafe_code)]
//! Source-device occupancy charts and target placement.
//!
//! A `Territory` records which regions of one source medium the represented
//! files occupy. `Geometry` accumulates territories across media, merges
//! near-adjacent ranges to keep the mapping table small, derives the largest
//! admissible block size, and finally emits the file area onto a planner,
//! producing the `Colonies` translation from source offsets to target
//! offsets.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};
use veneer_burn::Planner;
use veneer_error::{Result, VeneerError};
use veneer_extent::{Extent, ExtentList, Medium};
use veneer_types::{as_lower_bound, MediumId};

/// Occupied regions of one source medium: start -> end, ordered.
/// Invariant: `end[k] <= start[k+1]`; strictly less once optimally merged.
pub type Territory = BTreeMap<i64, i64>;

/// Territories across all source media.
pub type Planetary = BTreeMap<MediumId, Territory>;

/// Fold `[a, b)` and `[c, d)` into `[a, d)` whenever `c <= b + tolerance`.
/// Keeps the kernel mapping table small at the cost of dead weight between
/// merged ranges.
pub fn merge_extents(territory: &mut Territory, tolerance: i64) {
    let mut merged = Territory::new();
    let mut current: Option<(i64, i64)> = None;
    for (&start, &end) in territory.iter() {
        match current {
            Some((a, b)) if start <= b + tolerance => {
                current = Some((a, end.max(b)));
            }
            Some((a, b)) => {
                merged.insert(a, b);
                current = Some((start, end));
            }
            None => current = Some((start, end)),
        }
    }
    if let Some((a, b)) = current {
        merged.insert(a, b);
    }
    *territory = merged;
}

/// Count extents per `start mod cluster` class. A diagnostic for FAT "lane"
/// alignment; not a correctness feature.
#[must_use]
pub fn break_by_lanes(territory: &Territory, cluster: i64) -> BTreeMap<i64, usize> {
    let mut dist = BTreeMap::new();
    for &start in territory.keys() {
        *dist.entry(start.rem_euclid(cluster)).or_insert(0) += 1;
    }
    dist
}

/// Total bytes covered by a territory.
#[must_use]
pub fn territory_length(territory: &Territory) -> i64 {
    territory.iter().map(|(&s, &e)| e - s).sum()
}

/// Per-device summary emitted by `Geometry::analyze`.
#[derive(Debug, Clone, Serialize)]
pub struct LaneReport {
    pub medium: u64,
    pub extents: usize,
    pub net_bytes: i64,
    pub lanes: BTreeMap<i64, usize>,
}

/// The translation from source-territory offsets to target-device offsets
/// produced by `write_files`.
#[derive(Debug, Default, Clone)]
pub struct Colonies {
    /// Target offset where the file area begins.
    pub area_offset: i64,
    /// Per-medium `source start -> target offset` for every merged range.
    pub plan: Planetary,
}

impl Colonies {
    /// Target-device offset of a source extent. Looks up the last territory
    /// start at or before the extent offset; the delta against its recorded
    /// base gives the position.
    #[must_use]
    pub fn within_disk(&self, extent: &Extent) -> i64 {
        let src_to_trg = &self.plan[&extent.medium.id()];
        let (&start, &target) = src_to_trg
            .range(..=extent.offset())
            .next_back()
            .expect("extent charted before translation");
        extent.offset() - start + target
    }

    /// Offset of a source extent within the file area.
    #[must_use]
    pub fn within_area(&self, extent: &Extent) -> i64 {
        self.within_disk(extent) - self.area_offset
    }
}

/// Accumulated extent placement arithmetic for the whole source set.
#[derive(Default)]
pub struct Geometry {
    /// Extent merge tolerance, set from configuration before `optimize`.
    pub gap: i64,
    /// Registry of source media by id.
    pub media: BTreeMap<MediumId, Medium>,
    /// Occupancy charts by medium id.
    pub plan: Planetary,
    /// Cumulative granularity mask: every offset and every non-final length
    /// OR'd together.
    pub mask: i64,
}

impl Geometry {
    /// Register a resolved extent list in the charts, updating the
    /// granularity mask. The final extent's length is excluded — it may be
    /// an unaligned trailing byte count.
    pub fn chart_list(&mut self, extents: &ExtentList) {
        let mut iter = extents.iter().peekable();
        while let Some(extent) = iter.next() {
            self.chart(extent);
            self.mask |= extent.offset();
            if iter.peek().is_some() {
                self.mask |= extent.length();
            }
        }
    }

    /// Register one extent in the charts.
    pub fn chart(&mut self, extent: &Extent) {
        let id = extent.medium.id();
        self.media
            .entry(id)
            .or_insert_with(|| extent.medium.clone());
        let territory = self.plan.entry(id).or_default();
        let end = territory.entry(extent.offset()).or_insert(extent.end());
        *end = (*end).max(extent.end());
    }

    /// Total area occupied by all represented extents.
    #[must_use]
    pub fn total_length(&self) -> i64 {
        self.plan.values().map(territory_length).sum()
    }

    /// The largest block size dividing every recorded offset and length,
    /// as a bitmask of admissible sizes (every bit up to and including the
    /// lowest set mask bit). Also validates that aligned source media have
    /// blocks of at least one mapper sector.
    pub fn granularity(&self, mapper_block: i64) -> Result<i64> {
        for medium in self.media.values() {
            if medium.is_aligned() {
                let block = medium.block_size();
                if block < mapper_block {
                    return Err(VeneerError::SourceBlockTooSmall {
                        dev: medium
                            .block_device()
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| format!("{:#x}", medium.id().0)),
                        actual: block,
                        minimum: mapper_block,
                    });
                }
            }
        }
        Ok(!(as_lower_bound(self.mask) << 1))
    }

    /// Merge adjacent and near-adjacent extents on aligned media, keeping
    /// unaligned (file) charts as-is.
    pub fn optimize(&mut self, target_block: i64) {
        for (id, territory) in &mut self.plan {
            let aligned = self
                .media
                .get(id)
                .map(Medium::is_aligned)
                .unwrap_or(false);
            if !aligned {
                continue;
            }
            let net = territory_length(territory);
            let before = territory.len();
            merge_extents(territory, self.gap);
            let gross = territory_length(territory);
            info!(
                target: "veneer::geometry",
                medium = id.0,
                target_block,
                gap = self.gap,
                extents_before = before,
                extents_after = territory.len(),
                net_bytes = net,
                gross_bytes = gross,
                "territory merged"
            );
        }
    }

    /// Lane-affinity diagnostics for aligned media under a prospective
    /// cluster size.
    #[must_use]
    pub fn analyze(&self, target_block: i64) -> Vec<LaneReport> {
        let mut reports = Vec::new();
        for (id, territory) in &self.plan {
            let aligned = self
                .media
                .get(id)
                .map(Medium::is_aligned)
                .unwrap_or(false);
            if !aligned {
                continue;
            }
            reports.push(LaneReport {
                medium: id.0,
                extents: territory.len(),
                net_bytes: territory_length(territory),
                lanes: break_by_lanes(territory, target_block),
            });
        }
        reports
    }

    /// Emit one target extent per contiguous territory range, in medium-map
    /// iteration order, padding to `block` between extents. Returns the
    /// source-to-target translation.
    pub fn write_files_with(&self, planner: &mut Planner, block: i64) -> Result<Colonies> {
        let mut colonies = Colonies {
            area_offset: planner.offset(),
            plan: Planetary::new(),
        };
        for (id, territory) in &self.plan {
            let medium = self
                .media
                .get(id)
                .ok_or_else(|| VeneerError::assertion("charted territory without medium"))?;
            let translation = colonies.plan.entry(*id).or_default();
            for (&start, &end) in territory {
                let target =
                    planner.append(Extent::new(start, end - start, medium.clone()))?;
                translation.insert(start, target);
                planner.pad_to(block)?;
            }
        }
        debug!(
            target: "veneer::geometry",
            area_offset = colonies.area_offset,
            area_end = planner.offset(),
            "file area planned"
        );
        Ok(colonies)
    }

    /// Shorthand using the planner's maintained block size.
    pub fn write_files(&self, planner: &mut Planner) -> Result<Colonies> {
        self.write_files_with(planner, planner.block_size())
    }
}

/// Test helper and invariant check: territory ranges are disjoint and
/// separated by more than `gap` once merged.
#[must_use]
pub fn is_optimally_merged(territory: &Territory, gap: i64) -> bool {
    let mut prev_end: Option<i64> = None;
    for (&start, &end) in territory {
        if let Some(pe) = prev_end {
            if start <= pe + gap {
                return false;
            }
        }
        if end < start {
            return false;
        }
        prev_end = Some(end);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_burn::VecBurner;
    use veneer_types::{DevNum, MAPPER_SECTOR};

    fn disk() -> Medium {
        Medium::device(DevNum { major: 8, minor: 2 }, 4096)
    }

    #[test]
    fn merge_folds_within_tolerance() {
        let mut t = Territory::new();
        t.insert(0, 4096);
        t.insert(4096, 8192);
        t.insert(1 << 20, (1 << 20) + 4096);
        merge_extents(&mut t, 0);
        assert_eq!(t.len(), 2);
        assert_eq!(t[&0], 8192);
        merge_extents(&mut t, 1 << 30);
        assert_eq!(t.len(), 1);
        assert_eq!(t[&0], (1 << 20) + 4096);
    }

    #[test]
    fn merged_territories_stay_disjoint() {
        let mut t = Territory::new();
        t.insert(0, 1000);
        t.insert(500, 2000); // overlap
        t.insert(9000, 9500);
        merge_extents(&mut t, 64);
        assert!(is_optimally_merged(&t, 64));
        assert_eq!(t[&0], 2000);
    }

    #[test]
    fn granularity_tracks_worst_alignment() {
        let mut geo = Geometry::default();
        let medium = disk();
        geo.chart_list(&vec![
            Extent::new(0x10000, 0x4000, medium.clone()),
            Extent::new(0x2000, 0x1003, medium.clone()), // trailing bytes allowed
        ]);
        let mask = geo.granularity(MAPPER_SECTOR).unwrap();
        // lowest offset bit is 0x2000; sizes up to 0x2000 divide everything
        assert_eq!(mask & 0x3fff, 0x3fff);
        assert_eq!(mask & 0x4000, 0);
    }

    #[test]
    fn small_source_blocks_are_rejected() {
        let mut geo = Geometry::default();
        let medium = Medium::device(DevNum { major: 7, minor: 0 }, 0); // clamps to 512
        geo.chart(&Extent::new(0, 512, medium));
        assert!(geo.granularity(1024).is_err());
    }

    #[test]
    fn write_files_translates_consecutively_for_merged_ranges() {
        let mut geo = Geometry::default();
        geo.gap = 0;
        let medium = disk();
        // two adjacent source extents, as in scenario S2
        geo.chart(&Extent::new(0, 4096, medium.clone()));
        geo.chart(&Extent::new(4096, 4096, medium.clone()));
        geo.optimize(2048);
        assert_eq!(geo.plan[&medium.id()].len(), 1);

        let mut planner = Planner::new(Box::new(VecBurner::new(1)));
        planner.request_block_size(2048);
        planner.append(Extent::zeroes(0x8000)).unwrap();
        let colonies = geo.write_files(&mut planner).unwrap();
        assert_eq!(colonies.area_offset, 0x8000);

        let first = Extent::new(0, 4096, medium.clone());
        let second = Extent::new(4096, 4096, medium.clone());
        assert_eq!(colonies.within_disk(&first), 0x8000);
        assert_eq!(colonies.within_disk(&second), 0x8000 + 4096);
        assert_eq!(colonies.within_area(&second), 4096);
    }

    #[test]
    fn lanes_distribution() {
        let mut t = Territory::new();
        t.insert(0, 512);
        t.insert(4096, 5000);
        t.insert(6144, 7000); // 6144 % 4096 == 2048
        let lanes = break_by_lanes(&t, 4096);
        assert_eq!(lanes[&0], 2);
        assert_eq!(lanes[&2048], 1);
    }
}
