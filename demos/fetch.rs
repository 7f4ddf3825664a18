//! Fetch a URL through the blocking connection
//!
//! Prints the status line, the response headers in arrival order and the body.
//! Passing a second argument sends it as a POST body.
//!
//! Run with: cargo run --example fetch -- http://localhost:8080/ [body]

use anyhow::{bail, Context};
use std::io::{Read, Write};
use std::sync::Arc;
use url_connection::{ConnectionError, HttpUrlConnection, ReqwestEngine};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        bail!("usage: fetch <url> [body]");
    };
    let body = args.next();

    let engine = Arc::new(ReqwestEngine::new()?);
    let mut connection = HttpUrlConnection::new(target.parse().context("invalid url")?, engine);
    connection.set_request_property("Accept", "*/*")?;

    if let Some(body) = &body {
        connection.set_do_output(true)?;
        connection.set_fixed_length_streaming_mode(body.len() as u64)?;
        connection.output_stream()?.write_all(body.as_bytes())?;
    }

    let status = connection.response_code()?;
    let message = connection.response_message()?;
    println!("{status} {message}");

    let mut pos = 0;
    while let Some(name) = connection.header_field_key(pos).map(str::to_owned) {
        let value = connection.header_field_at(pos).unwrap_or_default().to_owned();
        println!("{name}: {value}");
        pos += 1;
    }
    println!();

    let mut payload = Vec::new();
    match connection.input_stream() {
        Ok(stream) => {
            stream.read_to_end(&mut payload)?;
        }
        Err(ConnectionError::NotFound(_)) | Err(ConnectionError::RedirectBody) => {
            if let Some(stream) = connection.error_stream() {
                stream.read_to_end(&mut payload)?;
            }
        }
        Err(err) => return Err(err.into()),
    }
    std::io::stdout().write_all(&payload)?;

    connection.disconnect();
    Ok(())
}
