use std::io::{self, IsTerminal};

use time::format_description::well_known::Rfc3339;

use crate::Result;
use crate::cli::ListArgs;
use crate::core::library::{EntrySummary, Library, PendingSummary};

use super::display::colorize;

pub fn handle_list(library: &Library, args: ListArgs) -> Result<()> {
    let snapshot = library.snapshot()?;
    let color = io::stdout().is_terminal();

    if snapshot.entries.is_empty() && snapshot.pending.is_empty() {
        println!("No machines yet. Create one with `vmshelf create <NAME>`.");
        return Ok(());
    }

    if !snapshot.entries.is_empty() {
        println!("  {:<24} {:<10} {:<7} LOCATION", "NAME", "ARCH", "DRIVES");
        for entry in &snapshot.entries {
            let selected = snapshot.selected == Some(entry.id);
            println!("{}", format_entry(entry, selected, color));
            if args.drives {
                for line in format_drives(entry) {
                    println!("{line}");
                }
            }
        }
    }

    if !snapshot.pending.is_empty() {
        println!();
        println!("Downloads in progress:");
        for pending in &snapshot.pending {
            println!("{}", format_pending(pending));
        }
    }
    Ok(())
}

pub fn handle_refresh(library: &Library) -> Result<()> {
    if library.refresh().wait()? {
        let count = library.snapshot()?.entries.len();
        println!("List updated; {count} machine(s) listed.");
    } else {
        println!("List already up to date.");
    }
    Ok(())
}

fn format_entry(entry: &EntrySummary, selected: bool, color: bool) -> String {
    let marker = if selected { "*" } else { " " };
    let name = format!("{:<24}", entry.name);
    let name = if entry.placeholder {
        colorize(&name, "33", color)
    } else {
        name
    };
    let location = entry
        .path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut flags = Vec::new();
    if entry.shortcut {
        flags.push("shortcut");
    }
    if entry.placeholder {
        flags.push("missing");
    }
    let suffix = if flags.is_empty() {
        String::new()
    } else {
        format!(" ({})", flags.join(", "))
    };
    format!(
        "{marker} {name} {:<10} {:<7} {location}{suffix}",
        entry.architecture.as_deref().unwrap_or("-"),
        entry.drives.len(),
    )
}

fn format_drives(entry: &EntrySummary) -> Vec<String> {
    entry
        .drives
        .iter()
        .enumerate()
        .map(|(index, drive)| {
            let backing = match (&drive.path, drive.removable) {
                (Some(path), _) => path.clone(),
                (None, true) => "removable".to_string(),
                (None, false) => "-".to_string(),
            };
            format!(
                "    [{index}] {:<12} {:<6} {:<8} {backing}",
                drive.name,
                drive.image_type.as_str(),
                drive.interface
            )
        })
        .collect()
}

fn format_pending(pending: &PendingSummary) -> String {
    let started = pending
        .started
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string());
    format!(
        "  [{}] {} from {} (started {started})",
        pending.id, pending.name, pending.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::machine::{Entry, ImageType, Machine, MachineConfig, Placeholder};
    use std::path::PathBuf;

    #[test]
    fn entries_show_selection_and_flags() {
        let entry = EntrySummary::from(&Entry::from(Placeholder::new(
            PathBuf::from("/vms/Old.vmbundle"),
            Some("Old".to_string()),
            true,
        )));
        let line = format_entry(&entry, true, false);
        assert!(line.starts_with("* Old"));
        assert!(line.ends_with("/vms/Old.vmbundle (shortcut, missing)"));
    }

    #[test]
    fn drives_list_backing_files_and_removables() {
        let mut config = MachineConfig::new("Debian").with_architecture("x86_64");
        config.new_drive("drive0", "disk.qcow2", ImageType::Disk, "ide");
        config.new_removable_drive("cd0", ImageType::Cd, "ide");
        let entry = EntrySummary::from(&Entry::from(Machine::new(config)));

        let lines = format_drives(&entry);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[0] drive0"));
        assert!(lines[0].ends_with("disk.qcow2"));
        assert!(lines[1].ends_with("removable"));
        assert!(format_entry(&entry, false, false).contains("x86_64"));
    }
}
