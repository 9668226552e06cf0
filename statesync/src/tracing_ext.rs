use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Installs a subscriber for the current thread that writes every event at
/// `min_level` or above into the returned buffer, without time or ANSI
/// colours. Callers should run on a current-thread runtime.
pub fn capture_logs(min_level: LevelFilter) -> CapturedLogs {
    let logs = CapturedLogs::default();

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .without_time()
        .with_max_level(min_level)
        .with_writer(logs.clone())
        .finish();
    // stays installed for the rest of the test
    std::mem::forget(tracing::subscriber::set_default(subscriber));

    logs
}

/// Shared log buffer, also used as the subscriber's writer.
#[derive(Default, Clone)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn captured(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
