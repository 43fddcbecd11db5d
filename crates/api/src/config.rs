//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,

    // Identity provider (external collaborator; we only verify its tokens)
    pub identity_jwt_secret: String,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_price_standard: String,
    pub stripe_price_plus: String,
    pub stripe_price_elite: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            // Identity provider
            identity_jwt_secret: {
                let secret = env::var("IDENTITY_JWT_SECRET")
                    .map_err(|_| ConfigError::Missing("IDENTITY_JWT_SECRET"))?;
                // Ensure the verification key is cryptographically strong
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "IDENTITY_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Stripe
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_price_standard: env::var("STRIPE_PRICE_STANDARD")
                .unwrap_or_else(|_| "price_standard".to_string()),
            stripe_price_plus: env::var("STRIPE_PRICE_PLUS")
                .unwrap_or_else(|_| "price_plus".to_string()),
            stripe_price_elite: env::var("STRIPE_PRICE_ELITE")
                .unwrap_or_else(|_| "price_elite".to_string()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to ensure config tests run serially (they modify shared env vars)
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_identity_secret_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        env::set_var("DATABASE_URL", "postgres://test");

        // Missing secret
        env::remove_var("IDENTITY_JWT_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("IDENTITY_JWT_SECRET"))
        ));

        // Too-short secret rejected
        env::set_var("IDENTITY_JWT_SECRET", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WeakSecret(_))
        ));

        // Valid secret accepted
        env::set_var(
            "IDENTITY_JWT_SECRET",
            "test-identity-secret-at-least-32-characters",
        );
        assert!(Config::from_env().is_ok());

        env::remove_var("DATABASE_URL");
        env::remove_var("IDENTITY_JWT_SECRET");
    }
}
