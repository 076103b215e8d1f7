use serde::Deserialize;
use std::collections::HashMap;

use crate::config::StrategyConfig;
use crate::error::AppError;

/// An ordered list of providers to attempt for a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Strategy {
    pub name: String,
    pub providers: Vec<String>,
}

/// Partial view of a request body; only the `model` field matters for
/// routing and authorization.
#[derive(Debug, Deserialize)]
pub struct RequestProbe {
    #[serde(default)]
    pub model: Option<String>,
}

pub struct ModelRouter {
    strategies: HashMap<String, Strategy>,
}

impl ModelRouter {
    pub fn new(strategies: &[StrategyConfig]) -> Self {
        let strategies = strategies
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    Strategy {
                        name: s.name.clone(),
                        providers: s.providers.clone(),
                    },
                )
            })
            .collect();
        Self { strategies }
    }

    /// Selects the provider chain for a request from its body bytes. The
    /// caller has already isolated the bytes; the wire is never re-read.
    ///
    /// A `model` value that exactly matches a configured strategy name uses
    /// that strategy. Otherwise the value must be `<provider>/<model>` and a
    /// single-provider chain is synthesized from the prefix.
    pub fn select_strategy(&self, body: &[u8]) -> Result<Strategy, AppError> {
        let probe: RequestProbe = serde_json::from_slice(body)
            .map_err(|e| AppError::invalid_request(format!("invalid request body: {}", e)))?;

        let model = probe.model.unwrap_or_default();
        if model.is_empty() {
            return Err(AppError::invalid_request("model not found in request body"));
        }

        if let Some(strategy) = self.strategies.get(&model) {
            return Ok(strategy.clone());
        }

        let provider = match model.split_once('/') {
            Some((provider, _)) if !provider.is_empty() => provider,
            _ => {
                return Err(AppError::invalid_request(
                    "invalid model format; expected 'provider/model_name'",
                ))
            }
        };

        Ok(Strategy {
            name: "dynamic".to_string(),
            providers: vec![provider.to_string()],
        })
    }
}
