use std::io::{Read, Write};
use std::path::Path;

use cairn_types::ContentId;

use crate::format::format_bytes;
use crate::session::Session;
use crate::CliResult;

fn read_input(file: Option<&Path>) -> CliResult<Vec<u8>> {
    match file {
        Some(path) if path != Path::new("-") => Ok(std::fs::read(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?),
        _ => {
            let mut data = Vec::new();
            std::io::stdin().lock().read_to_end(&mut data)?;
            Ok(data)
        }
    }
}

pub(crate) fn run_put(session: &Session, file: Option<&Path>) -> CliResult<()> {
    let data = read_input(file)?;
    let (repo, _) = session.open()?;
    let id = repo.put_content(&data)?;
    repo.flush()?;
    tracing::info!(%id, size = %format_bytes(data.len() as u64), "stored content");
    println!("{id}");
    Ok(())
}

pub(crate) fn run_get(session: &Session, id: &str, output: Option<&Path>) -> CliResult<()> {
    let id: ContentId = id.parse()?;
    let (repo, _) = session.open()?;
    let data = repo.get_content(&id)?;
    match output {
        Some(path) => std::fs::write(path, &data)?,
        None => {
            let mut out = std::io::stdout().lock();
            out.write_all(&data)?;
            out.flush()?;
        }
    }
    Ok(())
}

pub(crate) fn run_rm(session: &Session, id: &str) -> CliResult<()> {
    let id: ContentId = id.parse()?;
    let (repo, _) = session.open()?;
    repo.delete_content(&id)?;
    repo.flush()?;
    println!("Deleted {id}");
    Ok(())
}

pub(crate) fn run_ls(session: &Session) -> CliResult<()> {
    let (repo, _) = session.open()?;
    for id in repo.list_content()? {
        println!("{id}");
    }
    Ok(())
}
