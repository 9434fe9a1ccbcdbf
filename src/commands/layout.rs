//! Layout command implementation

use gnwflash_core::layout::{legacy_table, LayoutTable, ProtocolLayout};

use super::CmdResult;

/// Print the shared memory address table
pub fn run_layout(layout: &ProtocolLayout, legacy: bool) -> CmdResult {
    if legacy {
        println!("Legacy single-buffer protocol (not supported for flashing):");
        print_table(&legacy_table()?);
    } else {
        println!(
            "Dual-context protocol, {} byte chunks:",
            layout.chunk_size()
        );
        print_table(layout.table());
    }
    Ok(())
}

/// Render `table` without the padding fields
fn format_table(table: &LayoutTable) -> String {
    let mut out = String::new();
    for (name, var) in table.iter() {
        let field = name.rsplit('.').next().unwrap_or(name);
        if field.starts_with('_') {
            continue;
        }
        out.push_str(&format!(
            "  0x{:08X}  {:>8}  {}\n",
            var.address, var.size, name
        ));
    }
    out
}

fn print_table(table: &LayoutTable) {
    println!("  {:10}  {:>8}  Name", "Address", "Size");
    print!("{}", format_table(table));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lists_contexts() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let text = format_table(layout.table());
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("  0x20000000"));
        assert!(first.ends_with("4  boot_magic"));
        assert!(text.contains("context0.ready"));
        assert!(text.contains("context1.buffer"));
        assert!(!text.contains("_reserved"));
    }

    #[test]
    fn test_legacy_table_hides_padding() {
        let text = format_table(&legacy_table().unwrap());
        assert!(text.contains("flash_buffer"));
        assert!(text.contains("program_start"));
        assert!(!text.contains("_pad"));
    }
}
