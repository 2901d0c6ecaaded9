use rater::{
    Notice, Outcome, Rater, RaterConfig, RaterConfigBuilder, RecordingNotifier, SharedNotifier,
};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub fn rater(build: impl FnOnce(RaterConfigBuilder) -> RaterConfigBuilder) -> Rater<u64> {
    Rater::new(build(RaterConfig::builder()).build().unwrap())
}

pub fn recorder() -> (Arc<RecordingNotifier<u64>>, SharedNotifier<u64>) {
    let recorder = Arc::new(RecordingNotifier::<u64>::new());
    let notifier: SharedNotifier<u64> = recorder.clone();
    (recorder, notifier)
}

pub async fn fire(rater: &Rater<u64>, key: u64, notifier: &SharedNotifier<u64>) -> Outcome<()> {
    rater.handle_event(key, notifier, || async { Ok::<_, Infallible>(()) }).await.unwrap()
}

/// Like `fire`, counting how often the action actually ran.
pub async fn fire_counted(
    rater: &Rater<u64>,
    key: u64,
    notifier: &SharedNotifier<u64>,
    calls: &Arc<AtomicUsize>,
) -> Outcome<()> {
    let calls = calls.clone();
    rater
        .handle_event(key, notifier, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(())
        })
        .await
        .unwrap()
}

pub async fn advance(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

pub fn cooldowns(recorder: &RecordingNotifier<u64>) -> usize {
    recorder.count(Notice::is_cooldown)
}

pub fn calmed(recorder: &RecordingNotifier<u64>) -> usize {
    recorder.count(|n| *n == Notice::Calmed)
}

#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route this thread's logs into a buffer until the guard drops.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .without_time()
        .finish();
    (writer, tracing::subscriber::set_default(subscriber))
}
