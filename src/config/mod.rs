use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,

    pub jwt_secret: String,

    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,

    // Auth settings - set to true to skip JWT verification in development
    #[serde(default)]
    pub auth_disabled: bool,

    // Ledger engine (TigerBeetle) settings
    #[serde(default = "default_tb_address")]
    pub tb_address: String,

    #[serde(default)]
    pub tb_cluster_id: u64,

    /// Quote currency symbol: the cash leg of every pair.
    #[serde(default = "default_cash_ticker")]
    pub cash_ticker: String,

    /// Symbols to seed at bootstrap, `SYMBOL:LEDGER` comma-separated. The
    /// cash ticker must be among them.
    #[serde(default = "default_tickers")]
    pub tickers: String,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_jwt_expiry() -> u64 {
    86400 // 24 hours
}

fn default_tb_address() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_cash_ticker() -> String {
    "USD".to_string()
}

fn default_tickers() -> String {
    "USD:1,BBCAUSD:20,BTCUSD:30".to_string()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    /// Parsed `SYMBOL:LEDGER` bootstrap list.
    pub fn ticker_seeds(&self) -> Vec<(String, i64)> {
        self.tickers
            .split(',')
            .filter_map(|entry| {
                let (symbol, ledger) = entry.trim().split_once(':')?;
                Some((symbol.trim().to_uppercase(), ledger.trim().parse().ok()?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_seeds_parse_symbol_ledger_pairs() {
        let config = AppConfig {
            environment: default_environment(),
            port: default_port(),
            database_url: String::new(),
            jwt_secret: String::new(),
            jwt_expiry_seconds: default_jwt_expiry(),
            auth_disabled: false,
            tb_address: default_tb_address(),
            tb_cluster_id: 0,
            cash_ticker: default_cash_ticker(),
            tickers: "usd:1, ACMEUSD:20, broken, BTCUSD:30".to_string(),
        };
        assert_eq!(
            config.ticker_seeds(),
            vec![
                ("USD".to_string(), 1),
                ("ACMEUSD".to_string(), 20),
                ("BTCUSD".to_string(), 30)
            ]
        );
    }
}
