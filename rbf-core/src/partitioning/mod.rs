//! MBR layout planner.
//!
//! Turns the declared partition list into final partition numbers, physical offsets and
//! filesystem identifiers. The output is computed once per run and read by every later
//! planning stage.

use crate::template::{FsKind, MountPoint, PartitionKind, PartitionSpec, SizeMb};
use rbf_error::{RbfError, RbfResult};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Offset of the first partition. Leaves room for the MBR and keeps 1 MiB alignment.
pub const PARTITION_BEGIN_MB: u64 = 1;

/// MBR slots shared by primary and extended partitions.
pub const MAX_PRIMARY_SLOTS: usize = 4;

/// Number of primaries below which parted skips a number for the first logical partition.
const PARTED_RENUMBER_THRESHOLD: usize = 3;

/// One planned partition's final geometry and identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    /// Index as written in the template.
    pub declared_index: u32,
    /// Number parted will actually assign; used for every device path.
    pub index: u32,
    pub size: SizeMb,
    pub begin: SizeMb,
    pub end: SizeMb,
    pub kind: PartitionKind,
    pub fs: Option<FsKind>,
    pub mountpoint: Option<MountPoint>,
    /// Full UUID, or an 8 character upper-case label for vfat.
    pub identifier: String,
}

impl LayoutEntry {
    pub fn is_extended(&self) -> bool {
        self.kind == PartitionKind::Extended
    }

    /// Entries that get a filesystem (everything except the extended container).
    pub fn has_filesystem(&self) -> bool {
        !self.is_extended() && self.fs.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint.as_ref().is_some_and(MountPoint::is_root)
    }

    pub fn is_swap(&self) -> bool {
        self.mountpoint.as_ref().is_some_and(MountPoint::is_swap)
    }

    /// fstab / kernel command line reference for this filesystem.
    pub fn fs_reference(&self) -> String {
        match self.fs {
            Some(fs) if fs.uses_short_label() => format!("LABEL={}", self.identifier),
            _ => format!("UUID={}", self.identifier),
        }
    }
}

/// Compute the layout with random v4 identifiers.
pub fn compute_layout(image_size: SizeMb, specs: &[PartitionSpec]) -> RbfResult<Vec<LayoutEntry>> {
    compute_layout_with(image_size, specs, Uuid::new_v4)
}

/// Compute the layout, drawing identifiers from `next_id`.
///
/// Fails without producing any entries when a size is malformed, the sizes overflow the
/// image, or the MBR ordering rules are violated.
pub fn compute_layout_with<F>(
    image_size: SizeMb,
    specs: &[PartitionSpec],
    mut next_id: F,
) -> RbfResult<Vec<LayoutEntry>>
where
    F: FnMut() -> Uuid,
{
    let sizes = specs
        .iter()
        .map(|spec| SizeMb::parse(&spec.size))
        .collect::<RbfResult<Vec<_>>>()?;

    let used = specs
        .iter()
        .zip(&sizes)
        .filter(|(spec, _)| spec.kind != PartitionKind::Extended)
        .try_fold(SizeMb::new(0), |acc, (_, size)| acc.checked_add(*size))
        .unwrap_or(SizeMb::new(u64::MAX));
    log::info!("Image size: {} partition size sum: {}", image_size, used);
    if used > image_size {
        return Err(RbfError::PartitionOverflow {
            used: used.mb(),
            available: image_size.mb(),
        });
    }

    let mut entries = Vec::with_capacity(specs.len());
    let mut identifiers = HashSet::new();
    let mut total_partition_count = 0usize;
    let mut primary_count = 0usize;
    let mut extended_started = false;
    let mut extended_end = None;
    let mut begin = SizeMb::new(PARTITION_BEGIN_MB);

    for (spec, size) in specs.iter().zip(sizes) {
        let declared = spec.index;
        if spec.kind.uses_slot() && total_partition_count == MAX_PRIMARY_SLOTS {
            return Err(RbfError::TooManyPrimaryPartitions { index: declared });
        }
        match spec.kind {
            PartitionKind::Logical if !extended_started => {
                return Err(RbfError::LogicalBeforeExtended { index: declared });
            }
            PartitionKind::Primary if extended_started => {
                return Err(RbfError::PrimaryAfterExtended { index: declared });
            }
            PartitionKind::Extended if extended_started => {
                return Err(RbfError::InvalidPartitionData(format!(
                    "partition {declared}: only one extended partition is allowed"
                )));
            }
            _ => {}
        }
        if spec.kind == PartitionKind::Primary {
            primary_count += 1;
        }
        if spec.kind.uses_slot() {
            total_partition_count += 1;
        }

        // parted skips a number when a logical partition follows fewer than three
        // primaries; report the number it will really assign.
        let index = if primary_count < PARTED_RENUMBER_THRESHOLD && extended_started {
            declared + 1
        } else {
            declared
        };

        let end = begin.checked_add(size).ok_or_else(|| RbfError::PartitionOverflow {
            used: u64::MAX,
            available: image_size.mb(),
        })?;
        if let Some(limit) = extended_end {
            if end > limit {
                return Err(RbfError::InvalidPartitionData(format!(
                    "logical partition {declared} ends at {end}, past its extended container ({limit})"
                )));
            }
        }

        let identifier = loop {
            let candidate = format_identifier(next_id(), spec.fs);
            if identifiers.insert(candidate.clone()) {
                break candidate;
            }
        };

        log::info!(
            "Creating partition {} {} {} {} {} {}",
            index,
            size,
            spec.kind,
            spec.fs.map(FsKind::as_str).unwrap_or("-"),
            spec.mountpoint.as_ref().map(MountPoint::as_str).unwrap_or("-"),
            identifier
        );
        entries.push(LayoutEntry {
            declared_index: declared,
            index,
            size,
            begin,
            end,
            kind: spec.kind,
            fs: spec.fs,
            mountpoint: spec.mountpoint.clone(),
            identifier,
        });

        if spec.kind == PartitionKind::Extended {
            extended_started = true;
            extended_end = Some(end);
        } else {
            begin = end;
        }
    }

    Ok(entries)
}

fn format_identifier(id: Uuid, fs: Option<FsKind>) -> String {
    let full = id.hyphenated().to_string();
    match fs {
        Some(fs) if fs.uses_short_label() => full[..8].to_uppercase(),
        _ => full,
    }
}

/// The entry mounted on `/`, if any.
pub fn root_entry(layout: &[LayoutEntry]) -> Option<&LayoutEntry> {
    layout.iter().find(|e| e.is_root())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_ids() -> impl FnMut() -> Uuid {
        let mut n = 0u128;
        move || {
            n += 1;
            Uuid::from_u128(n << 96 | n)
        }
    }

    fn primary(index: u32, size: &str, fs: FsKind, mp: &str) -> PartitionSpec {
        PartitionSpec::new(
            index,
            size,
            PartitionKind::Primary,
            fs,
            MountPoint::parse(mp).unwrap(),
        )
    }

    fn logical(index: u32, size: &str, fs: FsKind, mp: &str) -> PartitionSpec {
        PartitionSpec::new(
            index,
            size,
            PartitionKind::Logical,
            fs,
            MountPoint::parse(mp).unwrap(),
        )
    }

    fn reference_specs() -> Vec<PartitionSpec> {
        vec![
            primary(1, "100M", FsKind::Ext4, "/"),
            primary(2, "50M", FsKind::Vfat, "/boot"),
            PartitionSpec::extended(3, "2000M"),
            logical(4, "500M", FsKind::Ext4, "/data"),
        ]
    }

    #[test]
    fn reference_layout_offsets_and_numbering() {
        let layout =
            compute_layout_with(SizeMb::new(4096), &reference_specs(), seq_ids()).unwrap();
        assert_eq!(layout.len(), 4);

        let root = &layout[0];
        assert_eq!(root.begin.mb(), PARTITION_BEGIN_MB);
        assert_eq!(root.end.mb(), PARTITION_BEGIN_MB + 100);

        let boot = &layout[1];
        assert_eq!(boot.begin, root.end);
        assert_eq!(boot.end.mb(), boot.begin.mb() + 50);

        let extended = &layout[2];
        assert_eq!(extended.index, 3);
        assert_eq!(extended.begin, boot.end);

        let data = &layout[3];
        assert_eq!(data.declared_index, 4);
        assert_eq!(data.index, 5);
        assert_eq!(data.begin, extended.begin);
    }

    #[test]
    fn non_extended_entries_are_contiguous() {
        let specs = vec![
            primary(1, "64M", FsKind::Vfat, "/boot"),
            primary(2, "1G", FsKind::Ext4, "/"),
            primary(3, "256M", FsKind::Swap, "swap"),
            primary(4, "2G", FsKind::Xfs, "/srv"),
        ];
        let layout = compute_layout_with(SizeMb::new(8192), &specs, seq_ids()).unwrap();
        for pair in layout.windows(2) {
            assert_eq!(pair[0].end, pair[1].begin);
            assert!(pair[0].begin < pair[0].end);
        }
        let declared: Vec<u32> = layout.iter().map(|e| e.index).collect();
        assert_eq!(declared, vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_produces_no_layout() {
        let mut specs = reference_specs();
        specs[3] = logical(4, "4000M", FsKind::Ext4, "/data");
        let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
        assert!(matches!(
            err,
            RbfError::PartitionOverflow {
                used: 4150,
                available: 4096
            }
        ));
    }

    #[test]
    fn extended_size_does_not_count_towards_the_sum() {
        let specs = vec![
            primary(1, "1G", FsKind::Ext4, "/"),
            PartitionSpec::extended(2, "3G"),
            logical(3, "2G", FsKind::Ext4, "/home"),
        ];
        assert!(compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).is_ok());
    }

    #[test]
    fn sum_equal_to_image_size_is_accepted() {
        let specs = vec![primary(1, "4G", FsKind::Ext4, "/")];
        assert!(compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).is_ok());
    }

    #[test]
    fn invalid_size_is_rejected_before_arithmetic() {
        let specs = vec![primary(1, "100", FsKind::Ext4, "/")];
        let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
        assert!(matches!(err, RbfError::InvalidSize { .. }));
    }

    #[test]
    fn logical_without_extended_always_fails() {
        let cases = vec![
            vec![logical(1, "100M", FsKind::Ext4, "/")],
            vec![
                primary(1, "100M", FsKind::Ext4, "/"),
                logical(2, "100M", FsKind::Ext4, "/data"),
            ],
            vec![
                primary(1, "100M", FsKind::Ext4, "/"),
                primary(2, "100M", FsKind::Ext4, "/srv"),
                primary(3, "100M", FsKind::Ext4, "/opt"),
                logical(5, "100M", FsKind::Ext4, "/data"),
            ],
        ];
        for specs in cases {
            let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
            assert!(matches!(err, RbfError::LogicalBeforeExtended { .. }));
        }
    }

    #[test]
    fn primary_after_extended_fails() {
        let specs = vec![
            primary(1, "100M", FsKind::Ext4, "/"),
            PartitionSpec::extended(2, "1G"),
            primary(3, "100M", FsKind::Ext4, "/srv"),
        ];
        let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
        assert!(matches!(err, RbfError::PrimaryAfterExtended { index: 3 }));
    }

    #[test]
    fn fifth_slot_is_rejected() {
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            primary(2, "10M", FsKind::Ext4, "/a"),
            primary(3, "10M", FsKind::Ext4, "/b"),
            primary(4, "10M", FsKind::Ext4, "/c"),
            primary(5, "10M", FsKind::Ext4, "/d"),
        ];
        let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
        assert!(matches!(err, RbfError::TooManyPrimaryPartitions { index: 5 }));
    }

    #[test]
    fn logical_partitions_do_not_consume_slots() {
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            primary(2, "10M", FsKind::Ext4, "/a"),
            primary(3, "10M", FsKind::Ext4, "/b"),
            PartitionSpec::extended(4, "100M"),
            logical(5, "10M", FsKind::Ext4, "/c"),
            logical(6, "10M", FsKind::Ext4, "/d"),
            logical(7, "10M", FsKind::Ext4, "/e"),
        ];
        let layout = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap();
        assert_eq!(layout.len(), 7);
    }

    #[test]
    fn three_primaries_leave_logical_numbers_alone() {
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            primary(2, "10M", FsKind::Ext4, "/a"),
            primary(3, "10M", FsKind::Ext4, "/b"),
            PartitionSpec::extended(4, "100M"),
            logical(5, "10M", FsKind::Ext4, "/c"),
            logical(6, "10M", FsKind::Ext4, "/d"),
        ];
        let layout = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap();
        let numbers: Vec<u32> = layout.iter().map(|e| e.index).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn each_logical_after_two_primaries_shifts_by_exactly_one() {
        let mut specs = reference_specs();
        specs.push(logical(5, "100M", FsKind::Ext4, "/var"));
        specs.push(logical(6, "100M", FsKind::Ext4, "/home"));
        let layout = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap();
        let numbers: Vec<u32> = layout.iter().map(|e| e.index).collect();
        assert_eq!(numbers, vec![1, 2, 3, 5, 6, 7]);
    }

    #[test]
    fn logical_partitions_must_fit_in_their_container() {
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            PartitionSpec::extended(2, "100M"),
            logical(3, "60M", FsKind::Ext4, "/a"),
            logical(4, "60M", FsKind::Ext4, "/b"),
        ];
        let err = compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).unwrap_err();
        assert_eq!(err.code(), 103);
    }

    #[test]
    fn second_extended_is_rejected() {
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            PartitionSpec::extended(2, "100M"),
            PartitionSpec::extended(3, "100M"),
        ];
        assert!(compute_layout_with(SizeMb::new(4096), &specs, seq_ids()).is_err());
    }

    #[test]
    fn vfat_gets_short_uppercase_label() {
        let layout = compute_layout(SizeMb::new(4096), &reference_specs()).unwrap();
        let boot = &layout[1];
        assert_eq!(boot.identifier.len(), 8);
        assert!(boot
            .identifier
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_eq!(boot.fs_reference(), format!("LABEL={}", boot.identifier));

        let root = &layout[0];
        assert_eq!(root.identifier.len(), 36);
        assert!(Uuid::parse_str(&root.identifier).is_ok());
        assert_eq!(root.fs_reference(), format!("UUID={}", root.identifier));
    }

    #[test]
    fn identifiers_are_unique_within_a_run() {
        let ids = [1u128, 1, 2, 3, 4];
        let mut iter = ids.into_iter();
        let specs = vec![
            primary(1, "10M", FsKind::Ext4, "/"),
            primary(2, "10M", FsKind::Ext4, "/a"),
            primary(3, "10M", FsKind::Ext4, "/b"),
        ];
        let layout = compute_layout_with(SizeMb::new(4096), &specs, || {
            Uuid::from_u128(iter.next().unwrap())
        })
        .unwrap();
        let unique: HashSet<_> = layout.iter().map(|e| e.identifier.clone()).collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn empty_partition_list_is_legal() {
        let layout = compute_layout_with(SizeMb::new(4096), &[], seq_ids()).unwrap();
        assert!(layout.is_empty());
        assert!(root_entry(&layout).is_none());
    }
}
