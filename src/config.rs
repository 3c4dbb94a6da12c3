//! Configuration loading: process settings from the environment, the
//! account list from `pm_config.json`, and per-user strategy files from
//! `strategies/{user_id}/{strategy}.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::domain::{GridSpec, GridType};
use crate::error::{Error, Result};

/// Process-level settings, resolved from the environment (`.env`
/// supported) with sensible defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding `pm_config.json` and `strategies/`.
    pub config_dir: PathBuf,
    pub database_url: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Taker fee applied to market entries/exits.
    pub taker_fee: Decimal,
    /// Maker fee applied to resting grid orders.
    pub maker_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let taker_fee = env_decimal("GRIDBOT_TAKER_FEE", "0.0005")?;
        let maker_fee = env_decimal("GRIDBOT_MAKER_FEE", "0.0002")?;
        let format = match std::env::var("GRIDBOT_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Ok(Self {
            config_dir: std::env::var("GRIDBOT_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config")),
            database_url: std::env::var("GRIDBOT_DATABASE_URL")
                .unwrap_or_else(|_| "gridbot.db".to_string()),
            log_level: std::env::var("GRIDBOT_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: format,
            taker_fee,
            maker_fee,
        })
    }

    pub fn init_logging(&self) {
        let filter = EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true);
        match self.log_format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.init(),
        }
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.config_dir.join("pm_config.json")
    }

    pub fn strategy_path(&self, user_id: &str, strategy: &str) -> PathBuf {
        self.config_dir
            .join("strategies")
            .join(user_id)
            .join(format!("{strategy}.json"))
    }
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| Error::Config(format!("{key} is not a valid decimal: {raw}")))
}

/// Raw account file. Entries stay untyped so one malformed user cannot
/// poison the whole batch; the registry validates each one separately.
#[derive(Debug, Deserialize)]
pub struct AccountsConfig {
    pub users: BTreeMap<String, serde_json::Value>,
}

impl AccountsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

/// One user entry after per-entry decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub testnet: bool,
}

/// A strategy file as written by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub timeframe: String,
    pub leverage: u32,
    pub position_side: String,
    pub margin_mode: String,
    pub margin_type: String,
    pub trading_pairs: Vec<TradingPair>,
    #[serde(default)]
    pub grid_trading: Option<GridTradingConfig>,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    /// `indicator_name -> params` as free-form JSON, interpreted by the
    /// indicator factory.
    pub indicator_params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridTradingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub grid_type: Option<GridType>,
    #[serde(default)]
    pub ratio: Option<Decimal>,
    #[serde(default)]
    pub grid_levels: Option<u32>,
    #[serde(default)]
    pub upper_price: Option<Decimal>,
    #[serde(default)]
    pub lower_price: Option<Decimal>,
    #[serde(default)]
    pub move_up: bool,
    #[serde(default)]
    pub move_down: bool,
}

impl StrategyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: StrategyConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeframe.is_empty() {
            return Err(Error::Config("timeframe cannot be empty".into()));
        }
        if self.leverage == 0 {
            return Err(Error::Config("leverage must be at least 1".into()));
        }
        if self.trading_pairs.is_empty() {
            return Err(Error::Config("trading_pairs cannot be empty".into()));
        }
        for pair in &self.trading_pairs {
            if pair.symbol.is_empty() {
                return Err(Error::Config("trading pair symbol cannot be empty".into()));
            }
        }
        // Grid parameters are fully validated up front so the executor
        // never sees a half-specified band.
        self.grid_spec()?;
        Ok(())
    }

    /// The validated grid parameters, or `None` when grid trading is off.
    pub fn grid_spec(&self) -> Result<Option<GridSpec>> {
        let Some(grid) = &self.grid_trading else {
            return Ok(None);
        };
        if !grid.enabled {
            return Ok(None);
        }
        let ratio = grid.ratio.unwrap_or(Decimal::ONE);
        if ratio <= Decimal::ZERO || ratio > Decimal::ONE {
            return Err(Error::Config(format!("grid ratio must be in (0, 1], got {ratio}")));
        }
        let levels = grid.grid_levels.unwrap_or(0);
        if levels == 0 {
            return Err(Error::Config("grid_levels must be at least 1".into()));
        }
        let (upper, lower) = match (grid.upper_price, grid.lower_price) {
            (Some(u), Some(l)) => (u, l),
            _ => {
                return Err(Error::Config(
                    "grid_trading requires both upper_price and lower_price".into(),
                ))
            }
        };
        if upper <= lower {
            return Err(Error::Config(format!(
                "grid upper_price {upper} must exceed lower_price {lower}"
            )));
        }
        let grid_type = grid.grid_type.unwrap_or(GridType::Normal);
        if grid_type == GridType::Abnormal && ratio == Decimal::ONE {
            return Err(Error::Config(
                "abnormal grid requires ratio < 1 for the initial entry".into(),
            ));
        }
        Ok(Some(GridSpec {
            grid_type,
            ratio,
            levels,
            upper_price: upper,
            lower_price: lower,
            move_up: grid.move_up,
            move_down: grid.move_down,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn strategy_json() -> serde_json::Value {
        json!({
            "timeframe": "15m",
            "leverage": 10,
            "position_side": "BOTH",
            "margin_mode": "cross",
            "margin_type": "USDC",
            "trading_pairs": [
                { "symbol": "XRPUSDC", "indicator_params": { "ma_stop": { "period": 20 } } }
            ],
            "grid_trading": {
                "enabled": true,
                "grid_type": "normal",
                "grid_levels": 10,
                "upper_price": "1.05",
                "lower_price": "0.95"
            },
            "reverse": true
        })
    }

    #[test]
    fn valid_strategy_parses_and_validates() {
        let config: StrategyConfig = serde_json::from_value(strategy_json()).unwrap();
        config.validate().unwrap();
        let spec = config.grid_spec().unwrap().unwrap();
        assert_eq!(spec.levels, 10);
        assert_eq!(spec.ratio, Decimal::ONE);
        assert_eq!(spec.upper_price, dec!(1.05));
        assert!(config.reverse);
    }

    #[test]
    fn grid_without_band_fails_validation() {
        let mut raw = strategy_json();
        raw["grid_trading"]["upper_price"] = serde_json::Value::Null;
        let config: StrategyConfig = serde_json::from_value(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn abnormal_grid_requires_partial_ratio() {
        let mut raw = strategy_json();
        raw["grid_trading"]["grid_type"] = json!("abnormal");
        let config: StrategyConfig = serde_json::from_value(raw.clone()).unwrap();
        assert!(config.validate().is_err());

        raw["grid_trading"]["ratio"] = json!("0.4");
        let config: StrategyConfig = serde_json::from_value(raw).unwrap();
        let spec = config.grid_spec().unwrap().unwrap();
        assert_eq!(spec.grid_type, GridType::Abnormal);
        assert_eq!(spec.ratio, dec!(0.4));
    }

    #[test]
    fn empty_pairs_rejected() {
        let mut raw = strategy_json();
        raw["trading_pairs"] = json!([]);
        let config: StrategyConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_grid_yields_no_spec() {
        let mut raw = strategy_json();
        raw["grid_trading"]["enabled"] = json!(false);
        let config: StrategyConfig = serde_json::from_value(raw).unwrap();
        assert!(config.grid_spec().unwrap().is_none());
    }
}
