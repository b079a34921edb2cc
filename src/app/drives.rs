use crate::Result;
use crate::cli::{
    CreateDriveArgs, ImportDriveArgs, ReclaimArgs, RemoveDriveArgs, ResizeArgs, SizeArgs,
};
use crate::core::drives::{DriveSpec, ImportRequest};
use crate::core::library::Library;
use crate::core::machine::{ImageType, default_interface};

use super::display::format_bytes;
use super::edit_machine;

pub fn handle_import_drive(library: &Library, args: ImportDriveArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let name = edit_machine(library, id, |session| {
        let architecture = library.draft(session)?.architecture;
        let request = import_request(&args, architecture.as_deref());
        library.import_drive(session, request).wait()
    })?;
    println!("Added drive `{name}` to `{}`.", args.machine);
    Ok(())
}

fn import_request(args: &ImportDriveArgs, architecture: Option<&str>) -> ImportRequest {
    let mut request = ImportRequest::for_source(&args.source, architecture);
    if let Some(image_type) = args.image_type {
        request.image_type = image_type;
        request.interface = default_interface(architecture, image_type).to_string();
        request.raw = image_type == ImageType::Cd;
    }
    if let Some(interface) = &args.interface {
        request.interface = interface.clone();
    }
    request.raw |= args.raw;
    request.copy = !args.move_source;
    request
}

pub fn handle_create_drive(library: &Library, args: CreateDriveArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let name = edit_machine(library, id, |session| {
        let architecture = library.draft(session)?.architecture;
        let spec = DriveSpec {
            image_type: args.image_type,
            interface: args.interface.clone().unwrap_or_else(|| {
                default_interface(architecture.as_deref(), args.image_type).to_string()
            }),
            removable: args.removable,
            raw: args.raw,
            size_mib: args.size,
        };
        library
            .create_drive(session, spec, args.medium.clone())
            .wait()
    })?;
    if args.removable {
        println!("Added removable drive `{name}` to `{}`.", args.machine);
    } else {
        println!(
            "Created {} drive `{name}` on `{}`.",
            format_bytes(args.size * 1024 * 1024),
            args.machine
        );
    }
    Ok(())
}

pub fn handle_remove_drive(library: &Library, args: RemoveDriveArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let drive = edit_machine(library, id, |session| {
        library.remove_drive(session, args.index)
    })?;
    println!("Removed drive `{}` from `{}`.", drive.name, args.machine);
    Ok(())
}

pub fn handle_resize(library: &Library, args: ResizeArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    library
        .resize_drive(id, args.drive.clone(), args.size)
        .wait()?;
    println!(
        "Resized `{}` to {}.",
        args.drive,
        format_bytes(args.size * 1024 * 1024)
    );
    Ok(())
}

pub fn handle_reclaim(library: &Library, args: ReclaimArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let (_, before) = library.drive_size(id, args.drive.clone()).wait()?;
    library
        .reclaim_space(id, args.drive.clone(), args.compress)
        .wait()?;
    let (_, after) = library.drive_size(id, args.drive.clone()).wait()?;
    println!(
        "Reclaimed space on `{}`: {} -> {}.",
        args.drive,
        format_bytes(before),
        format_bytes(after)
    );
    Ok(())
}

pub fn handle_size(library: &Library, args: SizeArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    match args.drive {
        Some(drive) => {
            let (virtual_size, on_disk) = library.drive_size(id, drive.clone()).wait()?;
            println!(
                "{drive}: {} virtual, {} on disk",
                format_bytes(virtual_size),
                format_bytes(on_disk)
            );
        }
        None => {
            let total = library.compute_size(id).wait()?;
            println!("{}: {}", args.machine, format_bytes(total));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(source: &str) -> ImportDriveArgs {
        ImportDriveArgs {
            machine: "Debian".into(),
            source: PathBuf::from(source),
            image_type: None,
            interface: None,
            raw: false,
            move_source: false,
        }
    }

    #[test]
    fn import_request_follows_file_type() {
        let request = import_request(&args("/tmp/installer.iso"), Some("x86_64"));
        assert_eq!(request.image_type, ImageType::Cd);
        assert_eq!(request.interface, "ide");
        assert!(request.raw);
        assert!(request.copy);
    }

    #[test]
    fn explicit_flags_override_inferred_values() {
        let mut explicit = args("/tmp/disk.img");
        explicit.image_type = Some(ImageType::Kernel);
        explicit.interface = Some("virtio".into());
        explicit.move_source = true;
        let request = import_request(&explicit, Some("aarch64"));
        assert_eq!(request.image_type, ImageType::Kernel);
        assert_eq!(request.interface, "virtio");
        assert!(!request.raw);
        assert!(!request.copy);
    }
}
