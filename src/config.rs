use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EventBusError, EventBusResult};

const SOURCE: &str = "EVENTBUS_SOURCE";
const EVENT_INHERITANCE: &str = "EVENTBUS_EVENT_INHERITANCE";
const LOG_NO_SUBSCRIBER_MESSAGES: &str = "EVENTBUS_LOG_NO_SUBSCRIBER_MESSAGES";
const SEND_NO_SUBSCRIBER_EVENT: &str = "EVENTBUS_SEND_NO_SUBSCRIBER_EVENT";
const LOG_SUBSCRIBER_EXCEPTIONS: &str = "EVENTBUS_LOG_SUBSCRIBER_EXCEPTIONS";
const SEND_SUBSCRIBER_EXCEPTION_EVENT: &str = "EVENTBUS_SEND_SUBSCRIBER_EXCEPTION_EVENT";
const THROW_SUBSCRIBER_EXCEPTION: &str = "EVENTBUS_THROW_SUBSCRIBER_EXCEPTION";
const STRICT_METHOD_VERIFICATION: &str = "EVENTBUS_STRICT_METHOD_VERIFICATION";
const ASYNC_POOL_SIZE: &str = "EVENTBUS_ASYNC_POOL_SIZE";
const MAX_MAIN_DRAIN_MILLIS: &str = "EVENTBUS_MAX_MAIN_DRAIN_MILLIS";
const LOSSLESS: &str = "EVENTBUS_LOSSLESS";

/// Behaviour switches of an [`EventBus`](crate::EventBus).
///
/// Deserializes from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Name of the bus, used in logs
    pub source: String,
    /// Match events against subscriptions for their supertypes and interfaces
    pub event_inheritance: bool,
    pub log_no_subscriber_messages: bool,
    pub send_no_subscriber_event: bool,
    pub log_subscriber_exceptions: bool,
    pub send_subscriber_exception_event: bool,
    /// Return handler failures from `post` instead of reporting them as events
    pub throw_subscriber_exception: bool,
    /// Reject subscriber types no descriptor provider knows
    pub strict_method_verification: bool,
    /// Workers of the default pool; 0 picks the number of CPUs (at least 2)
    pub async_pool_size: usize,
    /// Longest slice a main-context drain runs before yielding
    pub max_main_drain_millis: u64,
    /// Hold events nobody subscribes to and deliver them once a matching subscriber registers
    pub lossless: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            source: "default".to_string(),
            event_inheritance: true,
            log_no_subscriber_messages: true,
            send_no_subscriber_event: true,
            log_subscriber_exceptions: true,
            send_subscriber_exception_event: true,
            throw_subscriber_exception: false,
            strict_method_verification: false,
            async_pool_size: 0,
            max_main_drain_millis: 10,
            lossless: false,
        }
    }
}

impl EventBusConfig {
    /// Loads the configuration from the environment (and a `.env` file, if present).
    ///
    /// Variables are named `EVENTBUS_` followed by the upper-cased field name. Unset
    /// variables keep their defaults.
    pub fn try_from_env() -> EventBusResult<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            source: env::var(SOURCE).unwrap_or(defaults.source),
            event_inheritance: parse_var(EVENT_INHERITANCE, defaults.event_inheritance)?,
            log_no_subscriber_messages: parse_var(
                LOG_NO_SUBSCRIBER_MESSAGES,
                defaults.log_no_subscriber_messages,
            )?,
            send_no_subscriber_event: parse_var(
                SEND_NO_SUBSCRIBER_EVENT,
                defaults.send_no_subscriber_event,
            )?,
            log_subscriber_exceptions: parse_var(
                LOG_SUBSCRIBER_EXCEPTIONS,
                defaults.log_subscriber_exceptions,
            )?,
            send_subscriber_exception_event: parse_var(
                SEND_SUBSCRIBER_EXCEPTION_EVENT,
                defaults.send_subscriber_exception_event,
            )?,
            throw_subscriber_exception: parse_var(
                THROW_SUBSCRIBER_EXCEPTION,
                defaults.throw_subscriber_exception,
            )?,
            strict_method_verification: parse_var(
                STRICT_METHOD_VERIFICATION,
                defaults.strict_method_verification,
            )?,
            async_pool_size: parse_var(ASYNC_POOL_SIZE, defaults.async_pool_size)?,
            max_main_drain_millis: parse_var(MAX_MAIN_DRAIN_MILLIS, defaults.max_main_drain_millis)?,
            lossless: parse_var(LOSSLESS, defaults.lossless)?,
        };

        info!("Loaded event bus configuration for {}", config.source);
        Ok(config)
    }

    /// Like [`try_from_env`](Self::try_from_env), falling back to defaults on bad input.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => {
                warn!("{}, using defaults", err);
                Self::default()
            }
        }
    }

    pub fn max_main_drain(&self) -> Duration {
        Duration::from_millis(self.max_main_drain_millis)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> EventBusResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EventBusError::Config(format!("failed to parse {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
