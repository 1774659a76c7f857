//! Command-line entry point.
//!
//! # Responsibility
//! - Provide a smoke probe for `docstore_core` linkage (`ping`).
//! - Run offline document rewrites (`rewrite`) for format migrations.
//!
//! Usage:
//!   docstore_cli
//!   docstore_cli rewrite <db-path> <table> [--generated-ids] [--chunk-size <n>]
//!
//! Logging goes to `$DOCSTORE_LOG_DIR` when that variable is set.

use docstore_core::{
    default_log_level, init_logging, open_db, CodecError, DocumentCodec, DocumentRepository,
    Entity, EntityKey, IdKind, RepositoryConfig, SqliteDocumentRepository, TableSpec,
    DEFAULT_CHUNK_SIZE,
};
use log::info;
use rusqlite::Connection;
use std::process::ExitCode;

/// Untyped document: the stored JSON body plus its row id.
struct RawDocument<K> {
    id: Option<K>,
    body: serde_json::Value,
}

impl<K: EntityKey> Entity for RawDocument<K> {
    type Id = K;

    fn id(&self) -> Option<K> {
        self.id.clone()
    }

    fn assign_id(&mut self, id: K) {
        self.id = Some(id);
    }
}

/// Re-serializes documents as compact JSON.
struct RawJsonCodec;

impl<K> DocumentCodec<RawDocument<K>> for RawJsonCodec {
    fn encode(&self, entity: &RawDocument<K>) -> Result<String, CodecError> {
        serde_json::to_string(&entity.body).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, document: &str) -> Result<RawDocument<K>, CodecError> {
        let body =
            serde_json::from_str(document).map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(RawDocument { id: None, body })
    }
}

struct RewriteArgs {
    db_path: String,
    table: String,
    id_kind: IdKind,
    chunk_size: usize,
}

fn main() -> ExitCode {
    if let Ok(log_dir) = std::env::var("DOCSTORE_LOG_DIR") {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("ping") => {
            println!("docstore_core ping={}", docstore_core::ping());
            println!("docstore_core version={}", docstore_core::core_version());
            ExitCode::SUCCESS
        }
        Some("rewrite") => match parse_rewrite_args(&args[1..]).and_then(|args| run_rewrite(&args))
        {
            Ok(rows) => {
                println!("rewritten={rows}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        },
        Some(other) => {
            eprintln!("unknown command `{other}`; expected `ping` or `rewrite`");
            ExitCode::from(2)
        }
    }
}

fn parse_rewrite_args(args: &[String]) -> Result<RewriteArgs, String> {
    let mut positional = Vec::new();
    let mut id_kind = IdKind::Text;
    let mut chunk_size = DEFAULT_CHUNK_SIZE;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--generated-ids" => id_kind = IdKind::Generated,
            "--chunk-size" => {
                let value = iter.next().ok_or("--chunk-size needs a value")?;
                chunk_size = value
                    .parse::<usize>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| format!("invalid chunk size `{value}`"))?;
            }
            other => positional.push(other.to_string()),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([db_path, table]) => Ok(RewriteArgs {
            db_path,
            table,
            id_kind,
            chunk_size,
        }),
        Err(_) => Err(
            "usage: rewrite <db-path> <table> [--generated-ids] [--chunk-size <n>]".to_string(),
        ),
    }
}

fn run_rewrite(args: &RewriteArgs) -> Result<usize, String> {
    let conn = open_db(&args.db_path).map_err(|err| err.to_string())?;
    let table = TableSpec::new(&args.table, args.id_kind).map_err(|err| err.to_string())?;
    let config = RepositoryConfig {
        chunk_size: args.chunk_size,
    };

    let rows = match args.id_kind {
        IdKind::Text => rewrite_table::<String>(&conn, table, &config),
        IdKind::Generated => rewrite_table::<i64>(&conn, table, &config),
    }
    .map_err(|err| err.to_string())?;

    info!(
        "event=cli_rewrite module=cli status=ok table={} rows={rows}",
        args.table
    );
    Ok(rows)
}

fn rewrite_table<K: EntityKey>(
    conn: &Connection,
    table: TableSpec,
    config: &RepositoryConfig,
) -> docstore_core::RepoResult<usize> {
    let repo: SqliteDocumentRepository<RawDocument<K>, RawJsonCodec> =
        SqliteDocumentRepository::with_codec(conn, table, RawJsonCodec)?.with_config(config);
    repo.rewrite_all(None)
}
