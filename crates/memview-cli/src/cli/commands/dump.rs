use anyhow::Context;
use memview_core::{dump_binary, dump_text, Document};
use tokio::io::AsyncWrite;

use super::load_registry;
use crate::cli::args::DumpArgs;
use crate::exit_codes::{EXIT_BAD_INPUT, EXIT_SUCCESS};

pub async fn run(args: DumpArgs) -> anyhow::Result<i32> {
    let registry = match load_registry(&args.snapshot).await? {
        Ok(registry) => registry,
        Err(code) => return Ok(code),
    };

    let doc = match &args.doc_id {
        Some(id) => registry.get(id),
        None => registry.current(),
    };
    let Some(doc) = doc else {
        match &args.doc_id {
            Some(id) => eprintln!("error: document not found: {}", id),
            None => eprintln!("error: snapshot has no documents"),
        }
        return Ok(EXIT_BAD_INPUT);
    };

    match &args.out {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            export(doc, &mut file, args.binary).await?;
            tracing::info!(doc_id = %doc.id(), path = %path.display(), "export written");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            export(doc, &mut stdout, args.binary).await?;
        }
    }
    Ok(EXIT_SUCCESS)
}

async fn export<W>(doc: &Document, writer: &mut W, binary: bool) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if binary {
        let bytes = dump_binary(doc, writer)
            .await
            .context("binary export failed")?;
        tracing::debug!(bytes, "binary export");
    } else {
        let lines = dump_text(doc, writer).await.context("text export failed")?;
        tracing::debug!(lines, "text export");
    }
    Ok(())
}
