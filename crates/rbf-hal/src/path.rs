/// Partition path helper for block devices. Loop, nvme and mmcblk devices take a `p` infix.
pub fn partition_path(disk: &str, num: u32) -> String {
    if disk.contains("loop") || disk.contains("nvme") || disk.contains("mmcblk") {
        format!("{}p{}", disk, num)
    } else {
        format!("{}{}", disk, num)
    }
}

#[cfg(test)]
mod tests {
    use super::partition_path;

    #[test]
    fn loop_devices_use_p_infix() {
        assert_eq!(partition_path("/dev/loop0", 5), "/dev/loop0p5");
        assert_eq!(partition_path("/dev/mmcblk0", 1), "/dev/mmcblk0p1");
    }

    #[test]
    fn scsi_disks_append_number() {
        assert_eq!(partition_path("/dev/sdb", 2), "/dev/sdb2");
    }
}
