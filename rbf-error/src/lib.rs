use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type RbfResult<T> = Result<T, RbfError>;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failure identifiers emitted by generated scripts.
///
/// Every guarded stage carries one of these; a non-zero script exit status is mapped back to
/// the variant with [`ProvisionCode::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionCode {
    Fstab,
    LoopDeviceExists,
    Fallocate,
    Parted,
    LoopDeviceCreate,
    PartitionDoesNotExist,
    Mounting,
    WriteRepo,
    CopyKernel,
    CopyFirmware,
    RpmDbInit,
    GroupInstall,
    PackageInstall,
    EtcOverlay,
    RootPass,
    Selinux,
    BoardScript,
    FinalizeScript,
    ExtlinuxConf,
    LoopDeviceDelete,
    Mkfs,
    Initramfs,
    NetworkConfig,
    Hostname,
}

impl ProvisionCode {
    pub const ALL: [ProvisionCode; 24] = [
        ProvisionCode::Fstab,
        ProvisionCode::LoopDeviceExists,
        ProvisionCode::Fallocate,
        ProvisionCode::Parted,
        ProvisionCode::LoopDeviceCreate,
        ProvisionCode::PartitionDoesNotExist,
        ProvisionCode::Mounting,
        ProvisionCode::WriteRepo,
        ProvisionCode::CopyKernel,
        ProvisionCode::CopyFirmware,
        ProvisionCode::RpmDbInit,
        ProvisionCode::GroupInstall,
        ProvisionCode::PackageInstall,
        ProvisionCode::EtcOverlay,
        ProvisionCode::RootPass,
        ProvisionCode::Selinux,
        ProvisionCode::BoardScript,
        ProvisionCode::FinalizeScript,
        ProvisionCode::ExtlinuxConf,
        ProvisionCode::LoopDeviceDelete,
        ProvisionCode::Mkfs,
        ProvisionCode::Initramfs,
        ProvisionCode::NetworkConfig,
        ProvisionCode::Hostname,
    ];

    pub fn code(self) -> u8 {
        match self {
            ProvisionCode::Fstab => 112,
            ProvisionCode::LoopDeviceExists => 200,
            ProvisionCode::Fallocate => 201,
            ProvisionCode::Parted => 202,
            ProvisionCode::LoopDeviceCreate => 203,
            ProvisionCode::PartitionDoesNotExist => 204,
            ProvisionCode::Mounting => 205,
            ProvisionCode::WriteRepo => 206,
            ProvisionCode::CopyKernel => 207,
            ProvisionCode::CopyFirmware => 208,
            ProvisionCode::RpmDbInit => 209,
            ProvisionCode::GroupInstall => 210,
            ProvisionCode::PackageInstall => 211,
            ProvisionCode::EtcOverlay => 212,
            ProvisionCode::RootPass => 213,
            ProvisionCode::Selinux => 214,
            ProvisionCode::BoardScript => 215,
            ProvisionCode::FinalizeScript => 216,
            ProvisionCode::ExtlinuxConf => 217,
            ProvisionCode::LoopDeviceDelete => 219,
            ProvisionCode::Mkfs => 220,
            ProvisionCode::Initramfs => 221,
            ProvisionCode::NetworkConfig => 222,
            ProvisionCode::Hostname => 223,
        }
    }

    /// Short upper-case tag printed in front of the message.
    pub fn name(self) -> &'static str {
        match self {
            ProvisionCode::Fstab => "FSTAB_ERROR",
            ProvisionCode::LoopDeviceExists => "LOOP_DEVICE_EXISTS",
            ProvisionCode::Fallocate => "FALLOCATE_ERROR",
            ProvisionCode::Parted => "PARTED_ERROR",
            ProvisionCode::LoopDeviceCreate => "LOOP_DEVICE_CREATE_ERROR",
            ProvisionCode::PartitionDoesNotExist => "PARTITION_DOES_NOT_EXIST",
            ProvisionCode::Mounting => "MOUNTING_ERROR",
            ProvisionCode::WriteRepo => "WRITE_REPO_ERROR",
            ProvisionCode::CopyKernel => "COPY_KERNEL_ERROR",
            ProvisionCode::CopyFirmware => "COPY_FIRMWARE_ERROR",
            ProvisionCode::RpmDbInit => "RPMDB_INIT_ERROR",
            ProvisionCode::GroupInstall => "GROUP_INSTALL_ERROR",
            ProvisionCode::PackageInstall => "PACKAGE_INSTALL_ERROR",
            ProvisionCode::EtcOverlay => "ETC_OVERLAY_ERROR",
            ProvisionCode::RootPass => "ROOT_PASS_ERROR",
            ProvisionCode::Selinux => "SELINUX_ERROR",
            ProvisionCode::BoardScript => "BOARD_SCRIPT_ERROR",
            ProvisionCode::FinalizeScript => "FINALIZE_SCRIPT_ERROR",
            ProvisionCode::ExtlinuxConf => "EXTLINUXCONF_ERROR",
            ProvisionCode::LoopDeviceDelete => "LOOP_DEVICE_DELETE_ERROR",
            ProvisionCode::Mkfs => "MKFS_ERROR",
            ProvisionCode::Initramfs => "INITRAMFS_ERROR",
            ProvisionCode::NetworkConfig => "NETWORK_CONFIG_ERROR",
            ProvisionCode::Hostname => "HOSTNAME_ERROR",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ProvisionCode::Fstab => "Could Not Create fstab",
            ProvisionCode::LoopDeviceExists => {
                "Specified Loop Device Already Exists. Check losetup -l"
            }
            ProvisionCode::Fallocate => "Error While Creating Image File",
            ProvisionCode::Parted => "Could Not Partition Image",
            ProvisionCode::LoopDeviceCreate => {
                "Could Not Create Loop Device. Device Might Be Busy. Check \"losetup -l\""
            }
            ProvisionCode::PartitionDoesNotExist => "Could Not Find Specified Partition",
            ProvisionCode::Mounting => "Could Not Mount Partitions",
            ProvisionCode::WriteRepo => "Could Not Write Repo Files",
            ProvisionCode::CopyKernel => "Could Not Copy Kernel",
            ProvisionCode::CopyFirmware => "Could Not Copy Firmware",
            ProvisionCode::RpmDbInit => "Could Not Init RPM DB",
            ProvisionCode::GroupInstall => "Error Installing Some Package Groups",
            ProvisionCode::PackageInstall => "Error Installing Some Packages",
            ProvisionCode::EtcOverlay => "Could Not Copy /etc Overlay",
            ProvisionCode::RootPass => "Could Not Set Empty Root Pass",
            ProvisionCode::Selinux => "Could Not Set SELINUX Status",
            ProvisionCode::BoardScript => "Error In Board Script",
            ProvisionCode::FinalizeScript => "Error In Finalize Script",
            ProvisionCode::ExtlinuxConf => "Error Creating /boot/extlinux/extlinux.conf",
            ProvisionCode::LoopDeviceDelete => {
                "Could Not Delete Loop Device. Device Might Be Busy. Check \"losetup -l\""
            }
            ProvisionCode::Mkfs => "Could Not Create Filesystem",
            ProvisionCode::Initramfs => "Could Not Create Initramfs",
            ProvisionCode::NetworkConfig => "Could Not Write Network Configuration",
            ProvisionCode::Hostname => "Could Not Write /etc/hostname",
        }
    }

    /// Map a script exit status back to the stage failure it signals.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| i32::from(c.code()) == code)
    }
}

impl std::fmt::Display for ProvisionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

#[derive(Error, Debug)]
pub enum RbfError {
    #[error("Incorrect arguments: {0}")]
    IncorrectArguments(String),

    #[error("Template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),

    #[error("Error parsing template {}: {reason}", .path.display())]
    TemplateParse { path: PathBuf, reason: String },

    #[error("Missing required template field: {0}")]
    MissingField(String),

    #[error("Invalid image definition: {0}")]
    ImageFile(String),

    #[error("Image already exists: {}", .0.display())]
    ImageExists(PathBuf),

    #[error("Invalid partition data: {0}")]
    InvalidPartitionData(String),

    #[error("No partition is mounted on /; every other mount point needs a root")]
    MissingRootPartition,

    #[error("Invalid size {value:?}: only integers with suffix G or M allowed")]
    InvalidSize { value: String },

    #[error("Partition sizes exceed image size: {used}M used of {available}M")]
    PartitionOverflow { used: u64, available: u64 },

    #[error("Cannot have more than 4 primary partitions (partition {index})")]
    TooManyPrimaryPartitions { index: u32 },

    #[error("Cannot create logical partition {index} before an extended partition")]
    LogicalBeforeExtended { index: u32 },

    #[error("Cannot create primary partition {index} after an extended partition")]
    PrimaryAfterExtended { index: u32 },

    #[error("No kernel type specified")]
    NoKernelType,

    #[error("Distro repository information incorrect: {0}")]
    IncorrectRepository(String),

    #[error("Could not find uboot in: {}", .0.display())]
    NoUboot(PathBuf),

    #[error("Could not find firmware in: {}", .0.display())]
    NoFirmware(PathBuf),

    #[error("Need etc overlay to continue: {} not found", .0.display())]
    NoEtcOverlay(PathBuf),

    #[error("You need to be root to build images")]
    NotRoot,

    #[error("Commands not found: [{}]; not executable: [{}]", .missing.join(", "), .not_executable.join(", "))]
    CommandsNotFound {
        missing: Vec<String>,
        not_executable: Vec<String>,
    },

    #[error("Please install {tool} (required for {fs} filesystems)")]
    FormatToolMissing { tool: String, fs: String },

    #[error("Stage {stage} failed: {code}")]
    Provisioning { code: ProvisionCode, stage: String },

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// The main script could not be run, or stopped without a stage code.
    #[error("Could not run {}: {reason}", .script.display())]
    Script { script: PathBuf, reason: String },

    #[error("Could not write {}: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Hal(#[from] HalError),
}

impl RbfError {
    /// Numeric identifier used as the process exit status.
    pub fn code(&self) -> u8 {
        match self {
            RbfError::IncorrectArguments(_) => 100,
            RbfError::TemplateParse { .. } => 101,
            RbfError::ImageFile(_) => 102,
            RbfError::InvalidPartitionData(_) | RbfError::MissingRootPartition => 103,
            RbfError::NoKernelType => 105,
            RbfError::IncorrectRepository(_) => 106,
            RbfError::ImageExists(_) => 107,
            RbfError::NoUboot(_) => 108,
            RbfError::LogicalBeforeExtended { .. } => 109,
            RbfError::PrimaryAfterExtended { .. } => 110,
            RbfError::InvalidSize { .. } | RbfError::PartitionOverflow { .. } => 111,
            RbfError::Cleanup(_) => 113,
            RbfError::NotRoot => 114,
            RbfError::CommandsNotFound { .. } => 115,
            RbfError::FormatToolMissing { .. } => 116,
            RbfError::NoFirmware(_) => 117,
            RbfError::TemplateNotFound(_) => 118,
            RbfError::TooManyPrimaryPartitions { .. } => 119,
            RbfError::MissingField(_) => 120,
            RbfError::Artifact { .. } => 121,
            RbfError::NoEtcOverlay(_) => 218,
            RbfError::Script { .. } => 224,
            RbfError::Provisioning { code, .. } => code.code(),
            RbfError::Hal(HalError::CommandNotFound(_)) => 115,
            // Outside the scripts the HAL is only asked for a free loop device.
            RbfError::Hal(_) => ProvisionCode::LoopDeviceCreate.code(),
        }
    }
}
