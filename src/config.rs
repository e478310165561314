use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::Address;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::analysis::{Thresholds, TokenConfig};
use crate::error::{AppError, AppResult};
use crate::jobs::ScheduleConfig;
use crate::planner::PlannerConfig;
use crate::providers::router::RouterConfig;
use crate::providers::Strategy;
use crate::settlement::{IntentSourceConfig, NegativeIntentConfig};

const ENV_PREFIX: &str = "REBALANCER";
const CONFIG_FILE: &str = "config/rebalancer";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database_url: String,
    pub database: DatabaseSettings,
    pub liquidity: LiquiditySettings,
    pub ledger: LedgerSettings,
    /// Tokens for every wallet without its own list
    #[serde(default)]
    pub tokens: Vec<TokenSettings>,
    #[serde(default)]
    pub wallet_tokens: Vec<WalletTokenSettings>,
}

/// Token targets for one rebalanced wallet
#[derive(Debug, Deserialize, Clone)]
pub struct WalletTokenSettings {
    pub wallet: String,
    pub tokens: Vec<TokenSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LiquiditySettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub thresholds: ThresholdSettings,
    pub target_slippage: Decimal,
    pub max_quote_slippage: Decimal,
    /// Whole units of the deficit token
    pub min_trade_amount: Decimal,
    pub pool_wallet: Option<String>,
    #[serde(default)]
    pub wallets: Vec<String>,
    pub wallet_strategies: WalletStrategySettings,
    pub negative_intent: NegativeIntentSettings,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ThresholdSettings {
    pub surplus: Decimal,
    pub deficit: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletStrategySettings {
    pub pool: Vec<String>,
    pub default: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegativeIntentSettings {
    pub rebalancing_percentage: Decimal,
    pub proof_timeout_secs: u64,
    pub backfill_blocks: u64,
    pub reward_deadline_secs: u64,
    /// Publishing signer, the ledger wallet when unset
    pub creator: Option<String>,
    #[serde(default)]
    pub intent_sources: Vec<IntentSourceSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntentSourceSettings {
    pub chain_id: u64,
    pub source_address: String,
    pub inbox: String,
    #[serde(default)]
    pub provers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerSettings {
    pub refresh_interval_secs: u64,
    /// Wallet whose balances are snapshotted
    pub wallet: String,
}

/// Balance targets in whole tokens
#[derive(Debug, Deserialize, Clone)]
pub struct TokenSettings {
    pub chain_id: u64,
    pub address: String,
    pub decimals: u8,
    pub symbol: String,
    pub min_balance: Decimal,
    pub target_balance: Decimal,
    pub max_balance: Decimal,
}

impl Settings {
    /// Defaults, then `config/rebalancer.*` if present, then
    /// `REBALANCER__SECTION__KEY` variables. `DATABASE_URL` is honoured too.
    pub fn load() -> AppResult<Self> {
        dotenv::dotenv().ok();
        Self::from_builder(Config::builder().add_source(File::with_name(CONFIG_FILE).required(false)))
    }

    pub(crate) fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> AppResult<Self> {
        let settings = defaults(builder)?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("liquidity.wallets")
                    .with_list_parse_key("liquidity.wallet_strategies.pool")
                    .with_list_parse_key("liquidity.wallet_strategies.default"),
            )
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        let pct = self.liquidity.negative_intent.rebalancing_percentage;
        if pct <= Decimal::ZERO || pct >= Decimal::ONE {
            return Err(AppError::Config(format!(
                "liquidity.negative_intent.rebalancing_percentage must be in (0, 1), got {}",
                pct
            )));
        }
        let per_wallet = self.wallet_tokens.iter().flat_map(|w| w.tokens.iter());
        for token in self.tokens.iter().chain(per_wallet) {
            if token.min_balance > token.target_balance || token.target_balance > token.max_balance {
                return Err(AppError::Config(format!(
                    "token {} on chain {}: expected min <= target <= max",
                    token.symbol, token.chain_id
                )));
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            surplus: self.liquidity.thresholds.surplus,
            deficit: self.liquidity.thresholds.deficit,
            target_slippage: self.liquidity.target_slippage,
        }
    }

    pub fn token_configs(&self) -> AppResult<Vec<TokenConfig>> {
        self.tokens.iter().map(TokenConfig::from_settings).collect()
    }

    /// Token list per scheduled wallet. Wallets without an entry in
    /// `wallet_tokens` use the global `tokens`.
    pub fn wallet_token_configs(&self) -> AppResult<HashMap<Address, Vec<TokenConfig>>> {
        let mut own = HashMap::with_capacity(self.wallet_tokens.len());
        for entry in &self.wallet_tokens {
            let wallet = parse_address("wallet_tokens.wallet", &entry.wallet)?;
            let tokens = entry
                .tokens
                .iter()
                .map(TokenConfig::from_settings)
                .collect::<AppResult<Vec<_>>>()?;
            if own.insert(wallet, tokens).is_some() {
                return Err(AppError::Config(format!(
                    "wallet_tokens: {} listed more than once",
                    wallet
                )));
            }
        }

        let shared = self.token_configs()?;
        let mut per_wallet = HashMap::new();
        for wallet in self.schedule_config()?.wallets {
            let tokens = own.remove(&wallet).unwrap_or_else(|| shared.clone());
            per_wallet.insert(wallet, tokens);
        }
        if let Some(orphan) = own.keys().next() {
            return Err(AppError::Config(format!(
                "wallet_tokens: {} is not a rebalanced wallet",
                orphan
            )));
        }
        Ok(per_wallet)
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            thresholds: self.thresholds(),
            min_trade_amount: self.liquidity.min_trade_amount,
        }
    }

    pub fn pool_wallet(&self) -> AppResult<Option<Address>> {
        self.liquidity
            .pool_wallet
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(|raw| parse_address("liquidity.pool_wallet", raw))
            .transpose()
    }

    pub fn router_config(&self) -> AppResult<RouterConfig> {
        let strategies = &self.liquidity.wallet_strategies;
        Ok(RouterConfig {
            pool_wallet: self.pool_wallet()?,
            pool_strategies: parse_strategies(&strategies.pool)?,
            default_strategies: parse_strategies(&strategies.default)?,
            max_quote_slippage: self.liquidity.max_quote_slippage,
        })
    }

    /// Fails when no pool wallet is configured
    pub fn negative_intent_config(&self) -> AppResult<NegativeIntentConfig> {
        let pool_wallet = self.pool_wallet()?.ok_or_else(|| {
            AppError::Config("liquidity.pool_wallet is required for negative intents".to_string())
        })?;
        let settings = &self.liquidity.negative_intent;
        let creator = match settings.creator.as_deref().filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_address("liquidity.negative_intent.creator", raw)?,
            None => self.ledger_wallet()?,
        };

        let mut sources = HashMap::with_capacity(settings.intent_sources.len());
        for source in &settings.intent_sources {
            let provers = source
                .provers
                .iter()
                .map(|raw| parse_address("intent_sources.provers", raw))
                .collect::<AppResult<Vec<_>>>()?;
            sources.insert(
                source.chain_id,
                IntentSourceConfig {
                    chain_id: source.chain_id,
                    source_address: parse_address("intent_sources.source_address", &source.source_address)?,
                    inbox: parse_address("intent_sources.inbox", &source.inbox)?,
                    provers,
                },
            );
        }

        Ok(NegativeIntentConfig {
            pool_wallet,
            creator,
            rebalancing_percentage: settings.rebalancing_percentage,
            proof_timeout: Duration::from_secs(settings.proof_timeout_secs),
            backfill_blocks: settings.backfill_blocks,
            reward_deadline_secs: settings.reward_deadline_secs,
            sources,
        })
    }

    pub fn ledger_wallet(&self) -> AppResult<Address> {
        parse_address("ledger.wallet", &self.ledger.wallet)
    }

    /// Rebalanced wallets default to the ledger wallet
    pub fn schedule_config(&self) -> AppResult<ScheduleConfig> {
        let mut wallets = self
            .liquidity
            .wallets
            .iter()
            .map(|raw| parse_address("liquidity.wallets", raw))
            .collect::<AppResult<Vec<_>>>()?;
        if wallets.is_empty() {
            wallets.push(self.ledger_wallet()?);
        }

        Ok(ScheduleConfig {
            ledger_refresh_interval: Duration::from_secs(self.ledger.refresh_interval_secs),
            check_balances_interval: Duration::from_secs(self.liquidity.interval_secs),
            check_balances_enabled: self.liquidity.enabled,
            wallets,
        })
    }
}

fn defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> AppResult<config::ConfigBuilder<config::builder::DefaultState>> {
    let default_strategies: Vec<String> = Strategy::ALL
        .iter()
        .filter(|s| **s != Strategy::NegativeIntent)
        .map(|s| s.as_str().to_string())
        .collect();

    Ok(builder
        .set_default("database_url", "postgresql://localhost/rebalancer")?
        .set_default("database.max_connections", 10)?
        .set_default("database.acquire_timeout_secs", 5)?
        .set_default("liquidity.enabled", true)?
        .set_default("liquidity.interval_secs", 300)?
        .set_default("liquidity.thresholds.surplus", 0.1)?
        .set_default("liquidity.thresholds.deficit", 0.2)?
        .set_default("liquidity.target_slippage", 0.02)?
        .set_default("liquidity.max_quote_slippage", 0.05)?
        .set_default("liquidity.min_trade_amount", 0)?
        .set_default("liquidity.wallet_strategies.pool", vec![Strategy::NegativeIntent.as_str()])?
        .set_default("liquidity.wallet_strategies.default", default_strategies)?
        .set_default("liquidity.negative_intent.rebalancing_percentage", 0.05)?
        .set_default("liquidity.negative_intent.proof_timeout_secs", 300)?
        .set_default("liquidity.negative_intent.backfill_blocks", 1000)?
        .set_default("liquidity.negative_intent.reward_deadline_secs", 5400)?
        .set_default("ledger.refresh_interval_secs", 60)?
        .set_default("ledger.wallet", Address::ZERO.to_string())?)
}

fn parse_address(field: &str, raw: &str) -> AppResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| AppError::Config(format!("{}: invalid address {:?}: {}", field, raw, e)))
}

fn parse_strategies(raw: &[String]) -> AppResult<Vec<Strategy>> {
    raw.iter()
        .map(|name| {
            name.trim()
                .parse::<Strategy>()
                .map_err(|e| AppError::Config(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use rust_decimal_macros::dec;

    const POOL: &str = "0x1111111111111111111111111111111111111111";

    fn from_toml(toml: &str) -> AppResult<Settings> {
        Settings::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings.liquidity.negative_intent.proof_timeout_secs, 300);
        assert_eq!(settings.liquidity.negative_intent.backfill_blocks, 1000);
        assert_eq!(settings.liquidity.negative_intent.reward_deadline_secs, 5400);
        assert_eq!(settings.liquidity.negative_intent.rebalancing_percentage, dec!(0.05));

        let router = settings.router_config().unwrap();
        assert_eq!(router.pool_wallet, None);
        assert_eq!(router.pool_strategies, vec![Strategy::NegativeIntent]);
        assert!(!router.default_strategies.contains(&Strategy::NegativeIntent));
        assert_eq!(router.default_strategies.len(), 9);
    }

    #[test]
    fn test_file_settings() {
        let settings = from_toml(&format!(
            r#"
            [liquidity]
            pool_wallet = "{pool}"
            min_trade_amount = 5
            wallets = ["{pool}"]

            [liquidity.wallet_strategies]
            pool = ["NegativeIntent"]
            default = ["cctp", "LiFi"]

            [[liquidity.negative_intent.intent_sources]]
            chain_id = 10
            source_address = "0x2222222222222222222222222222222222222222"
            inbox = "0x3333333333333333333333333333333333333333"
            provers = ["0x4444444444444444444444444444444444444444"]

            [[tokens]]
            chain_id = 10
            address = "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85"
            decimals = 6
            symbol = "USDC"
            min_balance = 100
            target_balance = 250.5
            max_balance = 1000
            "#,
            pool = POOL
        ))
        .unwrap();

        let router = settings.router_config().unwrap();
        assert_eq!(router.default_strategies, vec![Strategy::Cctp, Strategy::LiFi]);

        let intents = settings.negative_intent_config().unwrap();
        assert_eq!(intents.pool_wallet, POOL.parse::<Address>().unwrap());
        assert_eq!(intents.creator, Address::ZERO);
        assert_eq!(intents.sources[&10].provers.len(), 1);
        assert_eq!(intents.proof_timeout, Duration::from_secs(300));

        let tokens = settings.token_configs().unwrap();
        assert_eq!(tokens[0].target_balance.to::<u64>(), 250_500_000);
        assert_eq!(settings.planner_config().min_trade_amount, dec!(5));

        let schedule = settings.schedule_config().unwrap();
        assert_eq!(schedule.wallets, vec![POOL.parse::<Address>().unwrap()]);
    }

    #[test]
    fn test_negative_intents_need_pool_wallet() {
        let settings = from_toml("").unwrap();
        assert!(matches!(settings.negative_intent_config(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_strategy = from_toml("[liquidity.wallet_strategies]\npool = []\ndefault = [\"Teleport\"]").unwrap();
        assert!(matches!(bad_strategy.router_config(), Err(AppError::Config(_))));

        let bad_pct = from_toml("[liquidity.negative_intent]\nrebalancing_percentage = 1.5");
        assert!(matches!(bad_pct, Err(AppError::Config(_))));

        let bad_wallet = from_toml("[ledger]\nwallet = \"not-an-address\"").unwrap();
        assert!(matches!(bad_wallet.ledger_wallet(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_tokens_per_wallet() {
        let other = "0x9999999999999999999999999999999999999999";
        let settings = from_toml(&format!(
            r#"
            [ledger]
            wallet = "{pool}"

            [liquidity]
            pool_wallet = "{pool}"
            wallets = ["{pool}", "{other}"]

            [liquidity.negative_intent]
            creator = "{other}"

            [[tokens]]
            chain_id = 10
            address = "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85"
            decimals = 6
            symbol = "USDC"
            min_balance = 100
            target_balance = 500
            max_balance = 1000

            [[wallet_tokens]]
            wallet = "{other}"

            [[wallet_tokens.tokens]]
            chain_id = 8453
            address = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
            decimals = 6
            symbol = "USDC"
            min_balance = 10
            target_balance = 50
            max_balance = 100
            "#,
            pool = POOL,
            other = other
        ))
        .unwrap();

        let per_wallet = settings.wallet_token_configs().unwrap();
        let pool: Address = POOL.parse().unwrap();
        let other: Address = other.parse().unwrap();
        assert_eq!(per_wallet.len(), 2);
        assert_eq!(per_wallet[&pool][0].chain_id, 10);
        assert_eq!(per_wallet[&other].len(), 1);
        assert_eq!(per_wallet[&other][0].chain_id, 8453);
        assert_eq!(per_wallet[&other][0].target_balance.to::<u64>(), 50_000_000);

        assert_eq!(settings.negative_intent_config().unwrap().creator, other);
    }

    #[test]
    fn test_wallet_tokens_must_name_a_rebalanced_wallet() {
        let settings = from_toml(&format!(
            r#"
            [ledger]
            wallet = "{pool}"

            [[wallet_tokens]]
            wallet = "0x9999999999999999999999999999999999999999"
            tokens = []
            "#,
            pool = POOL
        ))
        .unwrap();
        assert!(matches!(settings.wallet_token_configs(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_schedule_falls_back_to_ledger_wallet() {
        let settings = from_toml(&format!("[ledger]\nwallet = \"{}\"", POOL)).unwrap();
        let schedule = settings.schedule_config().unwrap();
        assert_eq!(schedule.wallets, vec![POOL.parse::<Address>().unwrap()]);
        assert_eq!(schedule.check_balances_interval, Duration::from_secs(300));
    }
}
