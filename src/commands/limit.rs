use crate::args::LimitSetArgs;
use crate::commands::{ledger, Out};
use crate::ledger::LimitStatus;
use crate::{Config, Result};

pub async fn limit_show(config: &Config, user_id: i64) -> Result<Out<LimitStatus>> {
    let status = ledger(config).limit_status(user_id).await?;
    Ok(Out::new(
        format!(
            "Monthly limit {} {}, {} {} left this month",
            status.default_limit, status.currency, status.remaining, status.currency
        ),
        status,
    ))
}

/// Sets the monthly limit in the user's currency. What is left this month starts over.
pub async fn limit_set(config: &Config, args: &LimitSetArgs) -> Result<Out<LimitStatus>> {
    let ledger = ledger(config);
    ledger.set_limit(args.user(), args.amount()).await?;
    let status = ledger.limit_status(args.user()).await?;
    Ok(Out::new(
        format!("Monthly limit set to {} {}", status.default_limit, status.currency),
        status,
    ))
}

pub async fn limit_reset(config: &Config, user_id: i64) -> Result<Out<LimitStatus>> {
    let ledger = ledger(config);
    ledger.reset_limit(user_id).await?;
    let status = ledger.limit_status(user_id).await?;
    Ok(Out::new(
        format!("{} {} left this month", status.remaining, status.currency),
        status,
    ))
}

pub async fn limit_reset_all(config: &Config) -> Result<Out<u64>> {
    let count = ledger(config).reset_all_limits().await?;
    Ok(Out::new(format!("Reset the monthly limit of {count} users"), count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::CurrencySetArgs;
    use crate::commands::{currency_set, user_add};
    use crate::model::Amount;
    use crate::store::LedgerStore;
    use crate::test::TestEnv;
    use crate::Error;

    #[tokio::test]
    async fn test_limits_in_display_currency() {
        let env = TestEnv::new().await;
        let config = env.config();
        env.set_rate("USD", 0.5).await;
        user_add(&config, 1).await.unwrap();
        currency_set(&config, &CurrencySetArgs::new(1, "USD"))
            .await
            .unwrap();

        let out = limit_set(&config, &LimitSetArgs::new(1, Amount::from_minor(5000)))
            .await
            .unwrap();
        let status = out.structure().unwrap();
        assert_eq!(status.currency, "USD");
        assert_eq!(status.default_limit, Amount::from_minor(5000));
        // stored in the reference currency
        assert_eq!(env.db().user(1).await.unwrap().default_month_limit, 10_000);

        let err = limit_set(&config, &LimitSetArgs::new(1, Amount::from_minor(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        assert_eq!(limit_reset_all(&config).await.unwrap().structure(), Some(&1));
        let out = limit_reset(&config, 1).await.unwrap();
        assert_eq!(out.structure().unwrap().remaining, Amount::from_minor(5000));
    }
}
