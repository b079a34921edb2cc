use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::core::machine::ImageType;

const VERSION: &str = env!("VMSHELF_VERSION");

/// Top-level CLI definition for the `vmshelf` tool.
#[derive(Debug, Parser)]
#[command(
    name = "vmshelf",
    version = VERSION,
    about = "Keep a shelf of QEMU virtual machines and their disk images.",
    long_about = "vmshelf manages a directory of virtual machine bundles: it keeps their order,\n\
                  imports and converts drive images, and clones, moves or downloads whole machines."
)]
pub struct Cli {
    /// Path to an explicit settings file. Defaults to `$VMSHELF_HOME/vmshelf.toml`.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Load settings from PATH instead of the default location"
    )]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(global = true, short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the machine list and in-flight downloads.
    List(ListArgs),
    /// Pick up bundles added to the storage directory and mark vanished ones as missing.
    Refresh,
    /// Create a new machine.
    Create(CreateArgs),
    /// Copy, move or convert an image file into a machine.
    ImportDrive(ImportDriveArgs),
    /// Create a blank drive or an empty removable drive.
    CreateDrive(CreateDriveArgs),
    /// Remove a drive from a machine and delete its image.
    RemoveDrive(RemoveDriveArgs),
    /// Grow or shrink a drive image.
    Resize(ResizeArgs),
    /// Rewrite a drive image to release unused space.
    Reclaim(ReclaimArgs),
    /// Report the size of a machine or one of its drives.
    Size(SizeArgs),
    /// Duplicate a machine under a fresh name.
    Clone(MachineArgs),
    /// Copy a machine bundle out of the library.
    Export(ExportArgs),
    /// Move a machine bundle elsewhere and keep it listed as a shortcut.
    Move(MoveArgs),
    /// Delete a machine, or only remove it from the list with --forget.
    Delete(DeleteArgs),
    /// Add an existing machine bundle to the library.
    Import(ImportArgs),
    /// Create a machine from another one's configuration, without its drives.
    Template(MachineArgs),
    /// Download a zipped bundle, or a disk image wrapped in a new machine.
    Download(DownloadArgs),
}

#[derive(Debug, Args, Default)]
pub struct ListArgs {
    /// Print drives under each machine.
    #[arg(long, help = "Include each machine's drives in the listing")]
    pub drives: bool,
}

#[derive(Debug, Args)]
pub struct MachineArgs {
    /// Name of the machine.
    #[arg(value_name = "MACHINE")]
    pub machine: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(value_name = "NAME")]
    pub name: String,

    #[arg(long, value_name = "ARCH", help = "Guest architecture, e.g. x86_64 or aarch64")]
    pub arch: Option<String>,

    #[arg(long, value_name = "TARGET", help = "QEMU machine target, e.g. q35 or virt")]
    pub target: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub notes: Option<String>,

    /// Import these images as drives before the machine is created.
    #[arg(long = "drive", value_name = "PATH", help = "Import PATH as a drive (repeatable)")]
    pub drives: Vec<PathBuf>,

    /// Add a blank disk of this many MiB.
    #[arg(long, value_name = "MIB", help = "Add a blank qcow2 disk of MIB mebibytes")]
    pub disk_size: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ImportDriveArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "IMAGE")]
    pub source: PathBuf,

    #[arg(long = "type", value_name = "TYPE", value_parser = parse_image_type)]
    pub image_type: Option<ImageType>,

    #[arg(long, value_name = "INTERFACE")]
    pub interface: Option<String>,

    #[arg(long, help = "Keep the source format instead of converting to qcow2")]
    pub raw: bool,

    #[arg(long = "move", help = "Move the source file instead of copying it")]
    pub move_source: bool,
}

#[derive(Debug, Args)]
pub struct CreateDriveArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(long, value_name = "MIB", default_value_t = 10240)]
    pub size: u64,

    #[arg(long = "type", value_name = "TYPE", value_parser = parse_image_type, default_value = "disk")]
    pub image_type: ImageType,

    #[arg(long, value_name = "INTERFACE")]
    pub interface: Option<String>,

    #[arg(long, help = "Create a raw image instead of qcow2")]
    pub raw: bool,

    /// Create an empty removable drive, optionally with a medium inserted.
    #[arg(long, help = "Create a removable drive with no backing image")]
    pub removable: bool,

    #[arg(
        long,
        value_name = "PATH",
        requires = "removable",
        help = "Insert PATH into the removable drive once the machine is saved"
    )]
    pub medium: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RemoveDriveArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "INDEX")]
    pub index: usize,
}

#[derive(Debug, Args)]
pub struct ResizeArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "DRIVE")]
    pub drive: String,

    #[arg(value_name = "MIB")]
    pub size: u64,
}

#[derive(Debug, Args)]
pub struct ReclaimArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "DRIVE")]
    pub drive: String,

    #[arg(long, help = "Compress the rewritten image")]
    pub compress: bool,
}

#[derive(Debug, Args)]
pub struct SizeArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    /// Report this drive instead of the whole bundle.
    #[arg(value_name = "DRIVE")]
    pub drive: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "DESTINATION")]
    pub destination: PathBuf,
}

#[derive(Debug, Args)]
pub struct MoveArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(value_name = "DESTINATION")]
    pub destination: PathBuf,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(value_name = "MACHINE")]
    pub machine: String,

    #[arg(long, help = "Remove the entry from the list but leave the bundle on disk")]
    pub forget: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(value_name = "BUNDLE")]
    pub path: PathBuf,

    #[arg(long, help = "Reference the bundle in place instead of copying it into storage")]
    pub shortcut: bool,
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    #[arg(value_name = "URL")]
    pub url: String,

    #[arg(long, value_name = "HEX", help = "Expected SHA-256 of the downloaded file")]
    pub sha256: Option<String>,

    /// Treat the download as a disk image and create a machine with this name around it.
    #[arg(
        long = "image",
        value_name = "NAME",
        help = "Download a disk image and wrap it in a new machine called NAME"
    )]
    pub image_name: Option<String>,

    #[arg(long, value_name = "ARCH", requires = "image_name")]
    pub arch: Option<String>,

    #[arg(long = "type", value_name = "TYPE", value_parser = parse_image_type, requires = "image_name")]
    pub image_type: Option<ImageType>,
}

fn parse_image_type(input: &str) -> Result<ImageType, String> {
    ImageType::parse(input).ok_or_else(|| {
        format!("unknown image type `{input}` (expected disk, cd, bios, kernel, initrd or dtb)")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_create_with_drives() {
        let cli = Cli::try_parse_from([
            "vmshelf",
            "create",
            "Debian",
            "--arch",
            "aarch64",
            "--drive",
            "/tmp/a.qcow2",
            "--drive",
            "/tmp/b.iso",
            "--disk-size",
            "2048",
        ])
        .expect("parse create");
        let Commands::Create(args) = cli.command.expect("create command present") else {
            panic!("expected create command");
        };
        assert_eq!(args.name, "Debian");
        assert_eq!(args.arch.as_deref(), Some("aarch64"));
        assert_eq!(args.drives.len(), 2);
        assert_eq!(args.disk_size, Some(2048));
    }

    #[test]
    fn parse_import_drive_flags() {
        let cli = Cli::try_parse_from([
            "vmshelf",
            "import-drive",
            "Debian",
            "/tmp/disk.img",
            "--type",
            "cdrom",
            "--move",
        ])
        .expect("parse import-drive");
        let Commands::ImportDrive(args) = cli.command.expect("command present") else {
            panic!("expected import-drive command");
        };
        assert_eq!(args.image_type, Some(ImageType::Cd));
        assert!(args.move_source);
        assert!(!args.raw);
    }

    #[test]
    fn unknown_image_type_is_rejected() {
        let err = Cli::try_parse_from(["vmshelf", "create-drive", "Debian", "--type", "floppy"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn medium_requires_removable() {
        let err = Cli::try_parse_from(["vmshelf", "create-drive", "Debian", "--medium", "/tmp/x.iso"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn create_drive_defaults() {
        let cli = Cli::try_parse_from(["vmshelf", "create-drive", "Debian"]).expect("parse");
        let Commands::CreateDrive(args) = cli.command.expect("command present") else {
            panic!("expected create-drive command");
        };
        assert_eq!(args.size, 10240);
        assert_eq!(args.image_type, ImageType::Disk);
        assert!(!args.removable);
    }

    #[test]
    fn verbosity_is_global_and_counted() {
        let cli = Cli::try_parse_from(["vmshelf", "list", "-vv"]).expect("parse");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::List(_))));
    }

    #[test]
    fn download_image_options_require_image_name() {
        assert!(
            Cli::try_parse_from(["vmshelf", "download", "https://x/vm.img", "--arch", "x86_64"])
                .is_err()
        );
        let cli = Cli::try_parse_from([
            "vmshelf",
            "download",
            "https://x/vm.img",
            "--image",
            "Fresh",
            "--arch",
            "x86_64",
        ])
        .expect("parse download");
        let Commands::Download(args) = cli.command.expect("command present") else {
            panic!("expected download command");
        };
        assert_eq!(args.image_name.as_deref(), Some("Fresh"));
    }

    #[test]
    fn command_reports_embedded_version_string() {
        let command = Cli::command();
        assert_eq!(command.get_version(), Some(VERSION));
    }
}
