//! One-shot command-line client: runs each SQL statement given as an argument
//! against a wiresql server and prints result rows pipe-separated, in the
//! spirit of the sqlite3 shell.

use clap::Parser;
use wiresql_client::{params, Connection, SqlValue};

#[derive(Parser, Debug)]
#[command(name = "wiresql-cli")]
#[command(about = "Run SQL statements against a wiresql server", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "localhost:6750")]
    addr: String,

    /// SQL statements to run, in order
    statements: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let conn = Connection::connect(&args.addr).await?;

    for sql in &args.statements {
        let (_, rows) = conn.query_collect(sql, params![]).await?;
        for row in rows {
            let rendered: Vec<String> = row.iter().map(render).collect();
            println!("{}", rendered.join("|"));
        }
    }
    Ok(())
}

fn render(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(v) => v.clone(),
        SqlValue::Blob(v) => format!("<blob {} bytes>", v.len()),
        SqlValue::Boolean(v) => v.to_string(),
        SqlValue::Timestamp(v) => v.to_rfc3339(),
    }
}
