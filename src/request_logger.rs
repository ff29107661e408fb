use std::time::Instant;

use log::Level;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};

/// Fairing that logs one line per request: method, path, status and latency.
///
/// Query strings are left out; import URLs may carry presigned credentials.
pub struct RequestLogger;

#[derive(Clone, Copy)]
struct RequestStart(Instant);

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(|| RequestStart(Instant::now()));
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let RequestStart(started) = *request.local_cache(|| RequestStart(Instant::now()));
        let status = response.status();

        log::log!(
            level_for(status.code, request.uri().path().as_str()),
            "{} {} -> {} ({:.2}ms)",
            request.method(),
            request.uri().path(),
            status.code,
            started.elapsed().as_secs_f64() * 1000.0
        );
    }
}

fn level_for(status: u16, path: &str) -> Level {
    match status {
        500.. => Level::Warn,
        _ if path.ends_with("/health") => Level::Debug,
        _ => Level::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_log_louder_and_health_checks_quieter() {
        assert_eq!(level_for(503, "/api/v1/admin/imports"), Level::Warn);
        assert_eq!(level_for(200, "/api/v1/health"), Level::Debug);
        assert_eq!(level_for(403, "/api/v1/admin/imports"), Level::Info);
    }
}
