use crate::Result;
use crate::cli::{CreateArgs, DeleteArgs, ExportArgs, ImportArgs, MachineArgs, MoveArgs};
use crate::core::drives::{DriveSpec, ImportRequest};
use crate::core::library::Library;
use crate::core::machine::{ImageType, MachineConfig, default_interface};
use crate::core::session::SessionId;

use super::machine_name;

fn draft_config(args: &CreateArgs) -> MachineConfig {
    let mut config = MachineConfig::new(args.name.clone());
    config.architecture = args.arch.clone();
    config.target = args.target.clone();
    config.notes = args.notes.clone();
    config
}

fn stage_drives(library: &Library, session: SessionId, args: &CreateArgs) -> Result<()> {
    let architecture = args.arch.as_deref();
    for source in &args.drives {
        let request = ImportRequest::for_source(source, architecture);
        library.import_drive(session, request).wait()?;
    }
    if let Some(size_mib) = args.disk_size {
        let spec = DriveSpec {
            image_type: ImageType::Disk,
            interface: default_interface(architecture, ImageType::Disk).to_string(),
            removable: false,
            raw: false,
            size_mib,
        };
        library.create_drive(session, spec, None).wait()?;
    }
    Ok(())
}

pub fn handle_create(library: &Library, args: CreateArgs) -> Result<()> {
    let session = library.new_session(draft_config(&args))?;
    if let Err(err) = stage_drives(library, session, &args) {
        if let Err(discard_err) = library.discard(session).wait() {
            log::warn!("discarding new machine `{}` failed: {discard_err}", args.name);
        }
        return Err(err);
    }
    library.create(session).wait()?;
    println!("Created machine `{}`.", args.name);
    Ok(())
}

pub fn handle_clone(library: &Library, args: MachineArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let clone = library.clone_machine(id).wait()?;
    println!(
        "Cloned `{}` as `{}`.",
        args.machine,
        machine_name(library, clone)?
    );
    Ok(())
}

pub fn handle_export(library: &Library, args: ExportArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    library.export(id, args.destination.clone()).wait()?;
    println!(
        "Exported `{}` to {}.",
        args.machine,
        args.destination.display()
    );
    Ok(())
}

pub fn handle_move(library: &Library, args: MoveArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    library.move_machine(id, args.destination.clone()).wait()?;
    println!(
        "Moved `{}` to {}; it stays listed as a shortcut.",
        args.machine,
        args.destination.display()
    );
    Ok(())
}

pub fn handle_delete(library: &Library, args: DeleteArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    if args.forget {
        library.forget(id)?;
        println!("Removed `{}` from the list.", args.machine);
    } else {
        library.delete(id).wait()?;
        println!("Deleted `{}`.", args.machine);
    }
    Ok(())
}

pub fn handle_import(library: &Library, args: ImportArgs) -> Result<()> {
    let id = library
        .import_bundle(args.path.clone(), args.shortcut)
        .wait()?;
    println!(
        "Imported {} as `{}`.",
        args.path.display(),
        machine_name(library, id)?
    );
    Ok(())
}

pub fn handle_template(library: &Library, args: MachineArgs) -> Result<()> {
    let id = library.machine_id(&args.machine)?;
    let template = library.template(id).wait()?;
    println!(
        "Created `{}` from the configuration of `{}`.",
        machine_name(library, template)?,
        args.machine
    );
    Ok(())
}
