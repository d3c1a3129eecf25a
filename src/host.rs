use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stage::{Anchor, FieldTimeDeltaStage, OutputCollector, Record, Tuple};

/// In-flight tuples allowed per worker before the reader waits.
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// Records the output writer may fall behind by before `emit` waits.
const OUTPUT_QUEUE_DEPTH: usize = 1024;

// ─── Output ──────────────────────────────────────────────────────

/// Forwards emitted records to a dedicated writer and counts emits and acks.
///
/// Serialization and I/O happen on the blocking pool, so worker tasks never
/// touch the output stream. `emit` only blocks when the writer is
/// `OUTPUT_QUEUE_DEPTH` records behind.
pub struct JsonLinesCollector {
    tx: flume::Sender<(Anchor, Record)>,
    emitted: AtomicU64,
    acked: AtomicU64,
}

impl JsonLinesCollector {
    /// Starts the writer for `out`. The returned handle resolves to `out`,
    /// flushed, once the collector is dropped and every queued record has
    /// been written.
    pub fn spawn<W>(out: W) -> (Self, JoinHandle<W>)
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = flume::bounded(OUTPUT_QUEUE_DEPTH);
        let writer = tokio::task::spawn_blocking(move || write_lines(&rx, out));

        let collector = Self {
            tx,
            emitted: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        };
        (collector, writer)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

impl OutputCollector for JsonLinesCollector {
    fn emit(&self, anchor: Anchor, record: Record) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if self.tx.send((anchor, record)).is_err() {
            error!(%anchor, "output writer has exited, record dropped");
        }
    }

    fn ack(&self, _anchor: Anchor) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }
}

fn write_lines<W: Write>(rx: &flume::Receiver<(Anchor, Record)>, out: W) -> W {
    let mut out = BufWriter::new(out);

    for (anchor, record) in rx.iter() {
        let written = serde_json::to_writer(&mut out, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = written {
            warn!(%anchor, error = %err, "failed to write record downstream");
        }

        // flush whenever the queue runs dry so downstream is never left waiting
        if rx.is_empty() {
            if let Err(err) = out.flush() {
                warn!(error = %err, "failed to flush output");
            }
        }
    }

    match out.into_inner() {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err.error(), "failed to flush output");
            err.into_inner().into_parts().0
        }
    }
}

// ─── Input ───────────────────────────────────────────────────────

/// Totals for one run of the host loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Records handed to the stage
    pub received: u64,
    /// Lines that were not `[id, payload, metadata]` arrays
    pub rejected: u64,
}

/// Feeds JSON-line records from `input` to `workers` tasks sharing one
/// stage, until the input ends or `shutdown` fires. Returns after every
/// accepted record has been processed.
pub async fn run<R, C>(
    input: R,
    stage: Arc<FieldTimeDeltaStage>,
    collector: Arc<C>,
    workers: u32,
    shutdown: CancellationToken,
) -> HostStats
where
    R: AsyncBufRead + Unpin,
    C: OutputCollector + 'static,
{
    let workers = workers.max(1);
    let (tx, rx) = flume::bounded::<Tuple>(workers as usize * QUEUE_DEPTH_PER_WORKER);

    let mut handles = Vec::with_capacity(workers as usize);
    for worker_id in 0..workers {
        let rx = rx.clone();
        let stage = stage.clone();
        let collector = collector.clone();

        handles.push(tokio::spawn(async move {
            worker(worker_id, rx, stage, collector).await;
        }));
    }
    drop(rx);

    let mut stats = HostStats::default();
    let mut lines = LinesStream::new(input.lines());

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("shutdown requested, no longer reading input");
                break;
            }
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                error!(error = %err, "failed to read input");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                stats.rejected += 1;
                warn!(error = %err, "skipping line that is not an [id, payload, metadata] array");
                continue;
            }
        };

        let tuple = Tuple {
            anchor: Anchor(stats.received),
            record,
        };
        stats.received += 1;

        if tx.send_async(tuple).await.is_err() {
            error!("all workers exited, no longer reading input");
            break;
        }
    }

    // Closing the channel lets workers drain what is queued and exit.
    drop(tx);
    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "worker task ended abnormally");
        }
    }

    stats
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker<C: OutputCollector>(
    id: u32,
    rx: flume::Receiver<Tuple>,
    stage: Arc<FieldTimeDeltaStage>,
    collector: Arc<C>,
) {
    while let Ok(tuple) = rx.recv_async().await {
        stage.process(tuple, &*collector);
    }
    debug!(worker = id, "input drained, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::metrics::MetricSink;

    fn stage() -> (Arc<FieldTimeDeltaStage>, Arc<MetricSink>) {
        let mut config = StageConfig::new("/a/s");
        config.end_property = Some("/a/e".into());
        let sink = Arc::new(MetricSink::new());
        (
            Arc::new(FieldTimeDeltaStage::new(&config, sink.clone())),
            sink,
        )
    }

    const INPUT: &str = concat!(
        r#"["r1","{\"a\":{\"s\":\"2024-01-01T00:00:00Z\",\"e\":\"2024-01-01T00:00:05Z\"}}",{"p":1}]"#,
        "\n",
        "not a record\n",
        "\n",
        r#"["r2",null,{"p":2}]"#,
        "\n",
        r#"["r3","{\"a\":{}}",{"p":3}]"#,
        "\n",
    );

    #[tokio::test]
    async fn every_accepted_line_is_emitted_and_acked() {
        let (stage, sink) = stage();
        let (collector, writer) = JsonLinesCollector::spawn(Vec::new());
        let collector = Arc::new(collector);

        let stats = run(
            INPUT.as_bytes(),
            stage.clone(),
            collector.clone(),
            3,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(stats, HostStats { received: 3, rejected: 1 });
        assert_eq!(collector.emitted(), 3);
        assert_eq!(collector.acked(), 3);
        assert_eq!(sink.get(stage.metric_name()).unwrap().count, 1);

        drop(collector);
        let output = String::from_utf8(writer.await.unwrap()).unwrap();
        let mut lines: Vec<_> = output.lines().collect();
        lines.sort_unstable();
        let mut expected: Vec<_> = INPUT
            .lines()
            .filter(|line| line.starts_with('['))
            .collect();
        expected.sort_unstable();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn single_worker_preserves_input_order() {
        let (stage, _sink) = stage();
        let (collector, writer) = JsonLinesCollector::spawn(Vec::new());
        let collector = Arc::new(collector);
        let input: String = (0..2_500)
            .map(|i| format!("[\"r{i}\",null,{{}}]\n"))
            .collect();

        let stats = run(
            input.as_bytes(),
            stage,
            collector.clone(),
            1,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(stats.received, 2_500);

        drop(collector);
        let output = String::from_utf8(writer.await.unwrap()).unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn writer_finishes_when_collector_is_dropped() {
        let (collector, writer) = JsonLinesCollector::spawn(Vec::new());
        collector.emit(
            Anchor(0),
            Record::from_json(r#""r0""#, "null", r#"{"p":0}"#).unwrap(),
        );
        assert_eq!(collector.emitted(), 1);

        drop(collector);
        let output = writer.await.unwrap();
        assert_eq!(output, b"[\"r0\",null,{\"p\":0}]\n");
    }

    #[tokio::test]
    async fn cancelled_host_reads_nothing() {
        let (stage, _sink) = stage();
        let (collector, writer) = JsonLinesCollector::spawn(Vec::new());
        let collector = Arc::new(collector);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = run(INPUT.as_bytes(), stage, collector.clone(), 1, shutdown).await;
        assert_eq!(stats, HostStats::default());
        assert_eq!(collector.emitted(), 0);

        drop(collector);
        assert!(writer.await.unwrap().is_empty());
    }
}
