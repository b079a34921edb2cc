pub mod display;
pub mod download;
pub mod drives;
pub mod error;
pub mod list;
pub mod logging;
pub mod machines;

use std::path::Path;

use crate::core::library::Library;
use crate::core::machine::MachineId;
use crate::core::session::SessionId;
use crate::{Error, Result, resolve_settings};

pub use download::handle_download;
pub use drives::{
    handle_create_drive, handle_import_drive, handle_reclaim, handle_remove_drive, handle_resize,
    handle_size,
};
pub use error::exit_code;
pub use list::{handle_list, handle_refresh};
pub use machines::{
    handle_clone, handle_create, handle_delete, handle_export, handle_import, handle_move,
    handle_template,
};

/// Resolve settings and open the library. Settings warnings are logged by the library.
pub fn open_library(config_override: Option<&Path>) -> Result<Library> {
    Library::open(resolve_settings(config_override)?)
}

/// Name of the listed machine `id`.
pub(crate) fn machine_name(library: &Library, id: MachineId) -> Result<String> {
    library
        .snapshot()?
        .entries
        .into_iter()
        .find(|entry| entry.id == id)
        .map(|entry| entry.name)
        .ok_or(Error::MachineNotFound { id: id.get() })
}

/// Run `edit` in a session on `id`, saving when it succeeds and discarding when it fails.
pub(crate) fn edit_machine<T>(
    library: &Library,
    id: MachineId,
    edit: impl FnOnce(SessionId) -> Result<T>,
) -> Result<T> {
    let session = library.open_session(id)?;
    match edit(session) {
        Ok(value) => {
            library.save(session).wait()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(discard_err) = library.discard(session).wait() {
                log::warn!("discarding session {session} failed: {discard_err}");
            }
            Err(err)
        }
    }
}
