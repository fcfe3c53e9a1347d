//! Fallback resolver: tries each source in priority order, stops at the
//! first hit.

use tracing::info;

use cepgeo_common::{Coordinates, Outcome, Record};

use crate::traits::CoordinateSource;

/// Coordinates plus the source that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub coordinates: Coordinates,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub source: String,
    pub outcome: Outcome,
}

/// Everything that happened while resolving one record.
#[derive(Debug, Clone, Default)]
pub struct ResolveReport {
    pub resolution: Option<Resolution>,
    pub attempts: Vec<Attempt>,
}

impl ResolveReport {
    /// One-line summary of why nothing was found, for failure logs.
    pub fn failure_summary(&self) -> String {
        if self.attempts.is_empty() {
            return "no sources configured".to_string();
        }
        self.attempts
            .iter()
            .map(|a| match a.outcome.reason() {
                Some(reason) => format!("{}={} ({})", a.source, a.outcome.label(), reason),
                None => format!("{}={}", a.source, a.outcome.label()),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct FallbackResolver {
    sources: Vec<Box<dyn CoordinateSource>>,
}

impl FallbackResolver {
    pub fn new(sources: Vec<Box<dyn CoordinateSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Ask each source once, in order. Any non-`Found` outcome moves on to
    /// the next source; later sources are not called after a hit.
    pub async fn resolve_record(&self, cep: &str, record: &Record) -> ResolveReport {
        let mut report = ResolveReport::default();

        for source in &self.sources {
            let name = source.name().to_string();
            let outcome = source.resolve(cep, record).await;
            info!(
                cep,
                source = name.as_str(),
                outcome = outcome.label(),
                reason = outcome.reason().unwrap_or(""),
                "Source attempt"
            );

            let found = match &outcome {
                Outcome::Found(coords) => Some(coords.clone()),
                _ => None,
            };
            report.attempts.push(Attempt {
                source: name.clone(),
                outcome,
            });

            if let Some(coordinates) = found {
                info!(cep, source = name.as_str(), %coordinates, "Coordinates resolved");
                report.resolution = Some(Resolution {
                    coordinates,
                    source: name,
                });
                return report;
            }
        }

        info!(cep, attempts = report.attempts.len(), "No source had coordinates");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;

    fn coords() -> Coordinates {
        Coordinates::new("-23.55", "-46.63")
    }

    #[tokio::test]
    async fn stops_at_first_hit() {
        let a = ScriptedSource::new("a", Outcome::NotFound);
        let b = ScriptedSource::new("b", Outcome::Transient("timeout".into()));
        let c = ScriptedSource::new("c", Outcome::Found(coords()));
        let d = ScriptedSource::new("d", Outcome::Found(Coordinates::new("0", "0")));
        let (ca, cb, cc, cd) = (a.calls(), b.calls(), c.calls(), d.calls());

        let resolver =
            FallbackResolver::new(vec![Box::new(a), Box::new(b), Box::new(c), Box::new(d)]);
        let report = resolver.resolve_record("01001000", &Record::default()).await;

        assert_eq!(
            report.resolution,
            Some(Resolution {
                coordinates: coords(),
                source: "c".into()
            })
        );
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(ca.count(), 1);
        assert_eq!(cb.count(), 1);
        assert_eq!(cc.count(), 1);
        assert_eq!(cd.count(), 0);
    }

    #[tokio::test]
    async fn fatal_still_moves_on() {
        let resolver = FallbackResolver::new(vec![
            Box::new(ScriptedSource::new("a", Outcome::Fatal("bad input".into()))),
            Box::new(ScriptedSource::new("b", Outcome::Found(coords()))),
        ]);
        let report = resolver.resolve_record("01001000", &Record::default()).await;
        assert_eq!(report.resolution.map(|r| r.source), Some("b".to_string()));
    }

    #[tokio::test]
    async fn all_misses_yields_none_with_every_attempt_recorded() {
        let resolver = FallbackResolver::new(vec![
            Box::new(ScriptedSource::new("a", Outcome::NotFound)),
            Box::new(ScriptedSource::new("b", Outcome::Transient("quota".into()))),
        ]);
        let report = resolver.resolve_record("01001000", &Record::default()).await;

        assert!(report.resolution.is_none());
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.failure_summary(), "a=not_found; b=transient_error (quota)");
    }

    #[tokio::test]
    async fn empty_chain_resolves_nothing() {
        let resolver = FallbackResolver::new(Vec::new());
        let report = resolver.resolve_record("01001000", &Record::default()).await;
        assert!(report.resolution.is_none());
        assert_eq!(report.failure_summary(), "no sources configured");
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn misses_are_visible_at_info_level() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        FallbackResolver::new(vec![Box::new(ScriptedSource::new("geocoder", Outcome::NotFound))])
            .resolve_record("01001000", &Record::default())
            .await;

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("Source attempt"), "{text}");
        assert!(text.contains("not_found"), "{text}");
    }

    #[tokio::test]
    async fn sources_see_identifier_and_record() {
        let src = ScriptedSource::new("a", Outcome::NotFound);
        let calls = src.calls();
        let record: Record = serde_json::from_str(r#"{"cep":"01001000","localidade":"São Paulo"}"#).unwrap();

        FallbackResolver::new(vec![Box::new(src)])
            .resolve_record("01001000", &record)
            .await;

        assert_eq!(calls.ceps(), vec!["01001000".to_string()]);
    }
}
