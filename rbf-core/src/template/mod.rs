//! Board template model.
//!
//! A template is a TOML document describing one hardware target: image geometry, partition
//! table, repositories, packages, kernel source, network and finalization hooks. It is read
//! once into the `Raw*` serde structs below and then validated into an immutable
//! [`Template`]; nothing downstream ever sees an unvalidated field.

mod size;

pub use size::SizeMb;

use rbf_error::{RbfError, RbfResult};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Literal used by several template fields to mean "not provided".
pub const NONE_SENTINEL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Primary,
    Extended,
    Logical,
}

impl PartitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionKind::Primary => "primary",
            PartitionKind::Extended => "extended",
            PartitionKind::Logical => "logical",
        }
    }

    /// Primary and extended partitions each take one of the four MBR slots.
    pub fn uses_slot(self) -> bool {
        !matches!(self, PartitionKind::Logical)
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
    Vfat,
    Swap,
    Xfs,
    Btrfs,
}

impl FsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "vfat",
            FsKind::Swap => "swap",
            FsKind::Xfs => "xfs",
            FsKind::Btrfs => "btrfs",
        }
    }

    /// Filesystem name in parted's `mkpart` vocabulary.
    pub fn parted_name(self) -> &'static str {
        match self {
            FsKind::Swap => "linux-swap",
            FsKind::Vfat => "fat32",
            other => other.as_str(),
        }
    }

    /// Host tool that creates this filesystem.
    pub fn format_tool(self) -> &'static str {
        match self {
            FsKind::Ext2 => "mkfs.ext2",
            FsKind::Ext3 => "mkfs.ext3",
            FsKind::Ext4 => "mkfs.ext4",
            FsKind::Vfat => "mkfs.vfat",
            FsKind::Swap => "mkswap",
            FsKind::Xfs => "mkfs.xfs",
            FsKind::Btrfs => "mkfs.btrfs",
        }
    }

    /// FAT only carries an 8 character volume label, not a UUID.
    pub fn uses_short_label(self) -> bool {
        matches!(self, FsKind::Vfat)
    }
}

impl FromStr for FsKind {
    type Err = RbfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext2" => Ok(FsKind::Ext2),
            "ext3" => Ok(FsKind::Ext3),
            "ext4" => Ok(FsKind::Ext4),
            "vfat" => Ok(FsKind::Vfat),
            "swap" => Ok(FsKind::Swap),
            "xfs" => Ok(FsKind::Xfs),
            "btrfs" => Ok(FsKind::Btrfs),
            other => Err(RbfError::InvalidPartitionData(format!(
                "unsupported filesystem {other:?}"
            ))),
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a partition ends up: an absolute path inside the image, or swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MountPoint {
    Swap,
    Path(String),
}

impl MountPoint {
    pub fn parse(value: &str) -> Option<Self> {
        if value == "swap" {
            return Some(MountPoint::Swap);
        }
        if !value.starts_with('/') {
            return None;
        }
        let trimmed = value.trim_end_matches('/');
        if trimmed.is_empty() {
            Some(MountPoint::Path("/".to_string()))
        } else {
            Some(MountPoint::Path(trimmed.to_string()))
        }
    }

    pub fn root() -> Self {
        MountPoint::Path("/".to_string())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, MountPoint::Path(p) if p == "/")
    }

    pub fn is_swap(&self) -> bool {
        matches!(self, MountPoint::Swap)
    }

    pub fn as_str(&self) -> &str {
        match self {
            MountPoint::Swap => "swap",
            MountPoint::Path(p) => p,
        }
    }

    /// Nesting depth below `/` (`/` is 0, `/boot` is 1, `/boot/efi` is 2).
    pub fn depth(&self) -> usize {
        match self {
            MountPoint::Swap => 0,
            MountPoint::Path(p) => p.split('/').filter(|c| !c.is_empty()).count(),
        }
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MountPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub size: SizeMb,
    pub kind: String,
    pub path: PathBuf,
}

/// One partition exactly as declared; its size is normalized by the layout planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub index: u32,
    pub size: String,
    pub kind: PartitionKind,
    /// `None` only for extended containers.
    pub fs: Option<FsKind>,
    /// `None` only for extended containers.
    pub mountpoint: Option<MountPoint>,
}

impl PartitionSpec {
    pub fn new(
        index: u32,
        size: &str,
        kind: PartitionKind,
        fs: FsKind,
        mountpoint: MountPoint,
    ) -> Self {
        Self {
            index,
            size: size.to_string(),
            kind,
            fs: Some(fs),
            mountpoint: Some(mountpoint),
        }
    }

    pub fn extended(index: u32, size: &str) -> Self {
        Self {
            index,
            size: size.to_string(),
            kind: PartitionKind::Extended,
            fs: None,
            mountpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSet {
    pub groups: Vec<String>,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomKernel {
    pub image: PathBuf,
    pub initrd: Option<PathBuf>,
    pub dtb_dir: PathBuf,
    pub dtb: String,
    pub modules: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSpec {
    /// Copy prebuilt kernel, initrd, device trees and modules into the image.
    Custom(CustomKernel),
    /// Install the distribution kernel package and build a generic initramfs.
    Stock,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceConfig {
    Dhcp,
    Static {
        address: String,
        mask: String,
        gateway: String,
        nameserver: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub config: InterfaceConfig,
}

/// Validated board description. Created once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub board: String,
    pub workdir: PathBuf,
    pub distro: String,
    pub hostname: String,
    pub selinux: String,
    pub uboot: Option<PathBuf>,
    pub etc_overlay: PathBuf,
    /// Passed through verbatim to the board hook.
    pub root_files: String,
    pub extlinux: bool,
    pub finalize_script: PathBuf,
    pub firmware: Option<PathBuf>,
    pub image: ImageSpec,
    pub partitions: Vec<PartitionSpec>,
    pub repos: Vec<Repo>,
    pub packages: PackageSet,
    pub kernel: KernelSpec,
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTemplate {
    board: Option<String>,
    workdir: Option<String>,
    distro: Option<String>,
    hostname: Option<String>,
    selinux: Option<String>,
    uboot: Option<String>,
    #[serde(alias = "etcoverlay")]
    etc_overlay: Option<String>,
    #[serde(alias = "rootfiles")]
    root_files: Option<String>,
    #[serde(alias = "extlinuxconf")]
    extlinux: Option<bool>,
    #[serde(alias = "finalizescript")]
    finalize_script: Option<String>,
    firmware: Option<String>,
    image: Option<RawImage>,
    #[serde(default)]
    partitions: Vec<RawPartition>,
    #[serde(default)]
    repos: Vec<RawRepo>,
    packages: Option<RawPackages>,
    kernel: Option<RawKernel>,
    network: Option<RawNetwork>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    size: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPartition {
    index: Option<u32>,
    size: Option<String>,
    #[serde(rename = "type")]
    kind: Option<PartitionKind>,
    fs: Option<String>,
    mountpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPackages {
    #[serde(alias = "group")]
    groups: Option<String>,
    #[serde(alias = "package")]
    packages: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawKernel {
    #[serde(rename = "type")]
    kind: Option<String>,
    image: Option<String>,
    initrd: Option<String>,
    dtbdir: Option<String>,
    dtb: Option<String>,
    modules: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetwork {
    #[serde(default)]
    interfaces: Vec<RawInterface>,
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    name: Option<String>,
    config: Option<String>,
    #[serde(alias = "ipaddress")]
    address: Option<String>,
    #[serde(alias = "subnetmask")]
    mask: Option<String>,
    gateway: Option<String>,
    nameserver: Option<String>,
}

impl Template {
    /// Read and validate a template file.
    pub fn load(path: &Path) -> RbfResult<Self> {
        if !path.exists() {
            return Err(RbfError::TemplateNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|e| RbfError::TemplateParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let template = Self::from_toml_str(&content, path)?;
        log::info!(
            "Successfully parsed board template for: {}",
            template.board
        );
        Ok(template)
    }

    /// Parse a template from TOML text. `origin` is only used in error messages.
    pub fn from_toml_str(content: &str, origin: &Path) -> RbfResult<Self> {
        let raw: RawTemplate = toml::from_str(content).map_err(|e| RbfError::TemplateParse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        raw.validate()
    }

    /// True when the template asks for anything to be installed from repositories.
    pub fn wants_packages(&self) -> bool {
        !self.packages.groups.is_empty()
            || !self.packages.packages.is_empty()
            || matches!(self.kernel, KernelSpec::Stock)
    }
}

fn required(value: Option<String>, field: &str) -> RbfResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(RbfError::MissingField(field.to_string())),
    }
}

/// `None`, empty and the `none` sentinel all mean "not provided".
fn optional_path(value: Option<String>) -> Option<PathBuf> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != NONE_SENTINEL)
        .map(PathBuf::from)
}

/// Split a comma separated list, dropping blanks and repeats while keeping order.
pub fn split_list(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter(|item| seen.insert(item.to_string()))
        .map(str::to_string)
        .collect()
}

impl RawTemplate {
    fn validate(self) -> RbfResult<Template> {
        let board = required(self.board, "board")?;
        let workdir = PathBuf::from(required(self.workdir, "workdir")?);
        let hostname = required(self.hostname, "hostname")?;
        let etc_overlay = PathBuf::from(required(self.etc_overlay, "etc_overlay")?);
        let finalize_script = PathBuf::from(required(self.finalize_script, "finalize_script")?);

        let image = validate_image(self.image)?;
        let partitions = validate_partitions(self.partitions)?;
        let repos = validate_repos(self.repos)?;
        let packages = self
            .packages
            .map(|p| PackageSet {
                groups: split_list(p.groups.as_deref().unwrap_or_default()),
                packages: split_list(p.packages.as_deref().unwrap_or_default()),
            })
            .unwrap_or_default();
        let kernel = validate_kernel(self.kernel)?;
        let interfaces = validate_network(self.network.unwrap_or_default())?;

        let template = Template {
            board,
            workdir,
            distro: self.distro.unwrap_or_else(|| "Linux".to_string()),
            hostname,
            selinux: self.selinux.unwrap_or_else(|| "permissive".to_string()),
            uboot: optional_path(self.uboot),
            etc_overlay,
            root_files: self
                .root_files
                .unwrap_or_else(|| NONE_SENTINEL.to_string()),
            extlinux: self.extlinux.unwrap_or(true),
            finalize_script,
            firmware: optional_path(self.firmware),
            image,
            partitions,
            repos,
            packages,
            kernel,
            interfaces,
        };

        if template.wants_packages() && template.repos.is_empty() {
            return Err(RbfError::IncorrectRepository(
                "packages requested but no repository declared".to_string(),
            ));
        }
        Ok(template)
    }
}

fn validate_image(raw: Option<RawImage>) -> RbfResult<ImageSpec> {
    let incomplete = || RbfError::ImageFile("image size, type and path are required".to_string());
    let raw = raw.ok_or_else(incomplete)?;
    let (Some(size), Some(kind), Some(path)) = (raw.size, raw.kind, raw.path) else {
        return Err(incomplete());
    };
    let size = SizeMb::parse(&size)
        .map_err(|_| RbfError::ImageFile(format!("invalid image size {size:?}")))?;
    Ok(ImageSpec {
        size,
        kind,
        path: PathBuf::from(path),
    })
}

fn validate_partitions(raw: Vec<RawPartition>) -> RbfResult<Vec<PartitionSpec>> {
    let mut specs = Vec::with_capacity(raw.len());
    let mut mountpoints = HashSet::new();
    let mut has_root = false;
    let mut needs_root = false;

    for (pos, p) in raw.into_iter().enumerate() {
        let invalid =
            |what: &str| RbfError::InvalidPartitionData(format!("partition #{}: {what}", pos + 1));
        let (Some(index), Some(size), Some(kind)) = (p.index, p.size, p.kind) else {
            return Err(invalid("index, size and type are required"));
        };

        if kind == PartitionKind::Extended {
            specs.push(PartitionSpec::extended(index, &size));
            continue;
        }

        let (Some(fs), Some(mountpoint)) = (p.fs, p.mountpoint) else {
            return Err(invalid("fs and mountpoint are required"));
        };
        let fs = FsKind::from_str(&fs)?;
        let mountpoint = MountPoint::parse(&mountpoint)
            .ok_or_else(|| invalid(&format!("mountpoint {mountpoint:?} is not absolute")))?;
        if (fs == FsKind::Swap) != mountpoint.is_swap() {
            return Err(invalid("swap filesystems must use the swap mountpoint"));
        }
        if !mountpoint.is_swap() && !mountpoints.insert(mountpoint.clone()) {
            return Err(invalid(&format!("duplicate mountpoint {mountpoint}")));
        }
        has_root |= mountpoint.is_root();
        needs_root |= !mountpoint.is_swap();

        specs.push(PartitionSpec {
            index,
            size,
            kind,
            fs: Some(fs),
            mountpoint: Some(mountpoint),
        });
    }

    if needs_root && !has_root {
        return Err(RbfError::MissingRootPartition);
    }
    Ok(specs)
}

fn validate_repos(raw: Vec<RawRepo>) -> RbfResult<Vec<Repo>> {
    raw.into_iter()
        .map(|r| match (r.name, r.path) {
            (Some(name), Some(url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok(Repo {
                    name: name.trim().to_string(),
                    url: url.trim().to_string(),
                })
            }
            _ => Err(RbfError::IncorrectRepository(
                "every repo needs a name and a path".to_string(),
            )),
        })
        .collect()
}

fn validate_kernel(raw: Option<RawKernel>) -> RbfResult<KernelSpec> {
    let raw = raw.ok_or(RbfError::NoKernelType)?;
    match raw.kind.as_deref().map(str::trim) {
        Some("custom") => Ok(KernelSpec::Custom(CustomKernel {
            image: PathBuf::from(required(raw.image, "kernel.image")?),
            initrd: optional_path(raw.initrd),
            dtb_dir: PathBuf::from(required(raw.dtbdir, "kernel.dtbdir")?),
            dtb: required(raw.dtb, "kernel.dtb")?,
            modules: PathBuf::from(required(raw.modules, "kernel.modules")?),
        })),
        Some("stock") => Ok(KernelSpec::Stock),
        Some("none") => Ok(KernelSpec::None),
        _ => Err(RbfError::NoKernelType),
    }
}

fn validate_network(raw: RawNetwork) -> RbfResult<Vec<NetworkInterface>> {
    raw.interfaces
        .into_iter()
        .map(|i| {
            let name = required(i.name, "network.interfaces.name")?;
            let config = match i.config.as_deref().map(str::trim) {
                Some("static") => InterfaceConfig::Static {
                    address: required(i.address, "network.interfaces.address")?,
                    mask: required(i.mask, "network.interfaces.mask")?,
                    gateway: required(i.gateway, "network.interfaces.gateway")?,
                    nameserver: required(i.nameserver, "network.interfaces.nameserver")?,
                },
                _ => InterfaceConfig::Dhcp,
            };
            Ok(NetworkInterface { name, config })
        })
        .collect()
}
