use rbf_core::emit::{render, render_script, ScriptOptions};
use rbf_core::partitioning::PARTITION_BEGIN_MB;
use rbf_core::provisioning::{compile, HostBinding};
use rbf_core::template::Template;
use std::fs;
use tempfile::tempdir;

const CUBIETRUCK: &str = r#"
board = "cubietruck"
workdir = "/tmp/rbf-cubie"
distro = "Fedora"
hostname = "cubietruck"
selinux = "permissive"
etc_overlay = "etc"
finalize_script = "./finalize.sh"

[image]
size = "4096M"
type = "raw"
path = "cubietruck.img"

[[partitions]]
index = 1
size = "100M"
type = "primary"
fs = "ext4"
mountpoint = "/"

[[partitions]]
index = 2
size = "50M"
type = "primary"
fs = "vfat"
mountpoint = "/boot"

[[partitions]]
index = 3
size = "2000M"
type = "extended"

[[partitions]]
index = 4
size = "500M"
type = "logical"
fs = "ext4"
mountpoint = "/data"

[[repos]]
name = "fedora"
path = "http://dl.fedoraproject.org/pub/fedora/linux/releases/23/Everything/armhfp/os/"

[packages]
groups = "core"
packages = "vim-minimal"

[kernel]
type = "custom"
image = "kernel/zImage"
initrd = "none"
dtbdir = "kernel/dtbs"
dtb = "sun7i-a20-cubietruck.dtb"
modules = "kernel/modules/4.2.0"
"#;

fn load(content: &str) -> Template {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cubietruck.toml");
    fs::write(&path, content).unwrap();
    Template::load(&path).unwrap()
}

fn position(script: &str, needle: &str) -> usize {
    script
        .find(needle)
        .unwrap_or_else(|| panic!("{needle:?} not found in script"))
}

#[test]
fn reference_board_compiles_into_an_ordered_script() {
    let template = load(CUBIETRUCK);
    let compiled = compile(&template, &HostBinding::new("/dev/loop2")).unwrap();

    assert_eq!(compiled.layout.len(), 4);
    let root = &compiled.layout[0];
    let boot = &compiled.layout[1];
    let data = &compiled.layout[3];
    assert_eq!(root.begin.mb(), PARTITION_BEGIN_MB);
    assert_eq!(boot.begin, root.end);
    assert_eq!(data.index, data.declared_index + 1);

    let script = render_script(&compiled.plan, &ScriptOptions::new("rbf.log"));
    let root_mount = position(&script, "mount /dev/loop2p1 /tmp/rbf-cubie &>>");
    let boot_mount = position(&script, "mount /dev/loop2p2 /tmp/rbf-cubie/boot &>>");
    let data_mount = position(&script, "mount /dev/loop2p5 /tmp/rbf-cubie/data &>>");
    assert!(root_mount < boot_mount);
    assert!(root_mount < data_mount);

    assert!(script.contains(&format!("mkfs.vfat -n {} /dev/loop2p2", boot.identifier)));
    assert!(script.contains(&format!("mkfs.ext4 -U {} /dev/loop2p1", root.identifier)));
    assert!(!script.contains("/dev/loop2p3"));
    assert!(script.contains(&format!("append enforcing=0 root=UUID={}", root.identifier)));
    assert!(script.contains("\tkernel /zImage"));
    assert!(script.contains("\tfdtdir /dtbs"));
    assert!(!script.contains("\tinitrd"));
    assert!(script.contains("Installing kernel kernel/zImage for sun7i-a20-cubietruck.dtb"));
}

#[test]
fn overflowing_board_fails_before_any_stage() {
    let content = CUBIETRUCK.replace("size = \"500M\"", "size = \"4050M\"");
    let template = load(&content);
    let err = compile(&template, &HostBinding::new("/dev/loop2")).unwrap_err();
    assert_eq!(err.code(), 111);
}

#[test]
fn cleanup_script_undoes_mounts_and_releases_the_device() {
    let template = load(CUBIETRUCK);
    let compiled = compile(&template, &HostBinding::new("/dev/loop2")).unwrap();
    let opts = ScriptOptions::new("rbf.log").non_interactive();
    let blocks = render(&compiled.cleanup, &opts);
    let script = blocks.join("\n");

    let order = [
        "umount /tmp/rbf-cubie/sys ",
        "umount /tmp/rbf-cubie/proc ",
        "umount /tmp/rbf-cubie/data ",
        "umount /tmp/rbf-cubie/boot ",
        "umount /tmp/rbf-cubie ",
        "losetup -d /dev/loop2",
    ];
    let positions: Vec<usize> = order.iter().map(|n| position(&script, n)).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(script.contains("if [ $? != 0 ]; then exit 219; fi"));
    assert!(!script.contains("read -p"));
}

#[test]
fn boot_sub_script_holds_only_the_bootloader() {
    let template = load(CUBIETRUCK);
    let compiled = compile(&template, &HostBinding::new("/dev/loop2")).unwrap();
    let script = render_script(&compiled.boot(), &ScriptOptions::new("rbf.log"));
    assert!(script.contains("extlinux.conf << 'EOF'"));
    assert!(script.contains("menu autoboot Fedora"));
    assert!(!script.contains("fallocate"));
}

#[test]
fn shipped_templates_compile() {
    for name in ["cubietruck.toml", "bananapi-stock.toml"] {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../templates")
            .join(name);
        let template = Template::load(&path).unwrap();
        let compiled = compile(&template, &HostBinding::new("/dev/loop0")).unwrap();
        assert!(compiled.plan.stage("write-fstab").is_some(), "{name}");
        assert!(!compiled.cleanup.is_empty(), "{name}");
    }
}
