use memview_core::hex_addr;

use super::load_registry;
use crate::cli::args::ListArgs;
use crate::exit_codes::EXIT_SUCCESS;

pub async fn run(args: ListArgs) -> anyhow::Result<i32> {
    let registry = match load_registry(&args.snapshot).await? {
        Ok(registry) => registry,
        Err(code) => return Ok(code),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&registry.summaries())?);
        return Ok(EXIT_SUCCESS);
    }

    for id in registry.ids() {
        let Some(doc) = registry.get(id) else {
            continue;
        };
        let marker = if registry.current_id() == Some(id.as_str()) {
            '*'
        } else {
            ' '
        };

        let mut flags = Vec::new();
        if doc.is_start_address_stale() {
            flags.push("stale-address");
        }
        if doc.is_max_bytes_stale() {
            flags.push("stale-size");
        }
        if doc.is_modified() {
            flags.push("modified");
        }
        if doc.is_readonly() {
            flags.push("readonly");
        }

        println!(
            "{} {}  {}  {}..{}  {} bytes  [{}]",
            marker,
            id,
            doc.display_name(),
            hex_addr(doc.start_address(), true),
            hex_addr(doc.end_address(), true),
            doc.max_bytes(),
            flags.join(",")
        );
    }
    Ok(EXIT_SUCCESS)
}
