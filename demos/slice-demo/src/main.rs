//! slice-demo: one sliced transfer over the in-process rendezvous table.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=rendezvous_slice=trace slice-demo --bytes 13 --slice-size 4
//! slice-demo --strings --bytes 10000 --slice-size 1024 --recv-first
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rendezvous::bytes::Bytes;
use rendezvous::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "slice-demo")]
#[command(about = "Send one array through a rendezvous table in slices and check it arrives intact")]
struct Cli {
    /// Payload size in bytes
    #[arg(long, default_value_t = 13)]
    bytes: u64,

    /// Largest payload carried by one message
    #[arg(long, default_value_t = 4)]
    slice_size: u64,

    /// Per-step receive timeout
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    /// Send a string array (three elements) instead of raw bytes
    #[arg(long)]
    strings: bool,

    /// Start the receiver before the sender
    #[arg(long)]
    recv_first: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let value = payload(&cli)?;
    let attrs = SliceAttrs::new(
        "/job:demo/replica:0/task:0/device:CPU:0",
        1,
        "/job:demo/replica:0/task:1/device:CPU:0",
        "payload",
        value.dtype(),
    )
    .with_slice_size(cli.slice_size)
    .with_timeout(Duration::from_millis(cli.timeout_ms));

    let sender = SliceSender::new(attrs.clone())?;
    let receiver = SliceReceiver::new(attrs)?;
    let table = LocalRendezvous::new();
    let ctx = SessionContext::new(FrameAndIter::new(0, 0));

    tracing::info!(
        total_bytes = value.total_bytes(),
        slice_size = cli.slice_size,
        recv_first = cli.recv_first,
        "starting transfer"
    );

    let receiving = {
        let table = Arc::clone(&table);
        let ctx = ctx.clone();
        tokio::spawn(async move { receiver.recv(&*table, &ctx).await })
    };
    if cli.recv_first {
        let limit = Duration::from_millis(cli.timeout_ms);
        if !wait_for_pending(&table, limit).await {
            return Err(Error::deadline_exceeded(format!(
                "receiver did not register within {limit:?}"
            )));
        }
        tracing::info!(pending = table.pending_len(), "receiver registered");
    }
    sender.send(&*table, &ctx, &value, false)?;

    let received = receiving
        .await
        .map_err(|e| Error::internal(format!("receiver task failed: {e}")))??;

    if received.value != value {
        tracing::error!("received value differs from the one sent");
        return Err(Error::internal("round trip mismatch"));
    }
    tracing::info!(
        total_bytes = received.value.total_bytes(),
        pending = table.pending_len(),
        "transfer verified"
    );
    Ok(())
}

/// Wait until something is queued on `table`, for at most `limit`.
async fn wait_for_pending(table: &LocalRendezvous, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while table.pending_len() == 0 {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    true
}

fn payload(cli: &Cli) -> Result<Array, Error> {
    let data: Vec<u8> = (0..cli.bytes).map(|i| b'a' + (i % 26) as u8).collect();
    if !cli.strings {
        return Array::from_bytes(DataType::UInt8, Shape::vector(cli.bytes), data);
    }

    // One long element between two short ones.
    let elements = vec![
        Bytes::from_static(b"head"),
        Bytes::from(data),
        Bytes::from_static(b"tail"),
    ];
    Array::from_elements(Shape::vector(3), elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_waits_for_a_registered_receiver() {
        let table = LocalRendezvous::new();
        let attrs = SliceAttrs::new("/cpu:0", 1, "/cpu:1", "p", DataType::UInt8).with_slice_size(4);
        let receiver = SliceReceiver::new(attrs.clone()).unwrap();
        let receiving = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { receiver.recv(&*table, &SessionContext::default()).await })
        };

        assert!(wait_for_pending(&table, Duration::from_secs(5)).await);
        assert_eq!(table.pending_len(), 1, "only the header receive is queued");

        let value = Array::from_bytes(DataType::UInt8, Shape::vector(9), vec![3u8; 9]).unwrap();
        SliceSender::new(attrs)
            .unwrap()
            .send(&*table, &SessionContext::default(), &value, false)
            .unwrap();
        assert_eq!(receiving.await.unwrap().unwrap().value, value);
    }

    #[tokio::test]
    async fn waiting_on_an_idle_table_gives_up() {
        let table = LocalRendezvous::new();
        assert!(!wait_for_pending(&table, Duration::from_millis(10)).await);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["slice-demo", "--bytes", "10", "--strings", "--recv-first"]);
        assert_eq!(cli.bytes, 10);
        assert_eq!(cli.slice_size, 4);
        assert!(cli.strings && cli.recv_first);
        assert_eq!(payload(&cli).unwrap().total_bytes(), 18);
    }
}
