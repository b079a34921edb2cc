use crate::Result;
use crate::cli::DownloadArgs;
use crate::core::library::Library;
use crate::core::machine::MachineConfig;
use crate::downloads::{ImageDownloadRequest, ZipDownload};

use super::machine_name;

pub fn handle_download(library: &Library, args: DownloadArgs) -> Result<()> {
    let (pending, handle) = match args.image_name {
        Some(name) => {
            let mut config = MachineConfig::new(name);
            config.architecture = args.arch;
            library.start_image_download(ImageDownloadRequest {
                config,
                url: args.url.clone(),
                sha256: args.sha256,
                image_type: args.image_type,
            })?
        }
        None => library.start_zip_download(ZipDownload {
            url: args.url.clone(),
            sha256: args.sha256,
        })?,
    };
    println!("Downloading {} (pending #{pending})...", args.url);
    let id = handle.wait()?;
    println!("Downloaded `{}`.", machine_name(library, id)?);
    Ok(())
}
