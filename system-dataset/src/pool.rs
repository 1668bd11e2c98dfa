// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing and validating the pool that hosts the system dataset.

use crate::error::{Error, ValidationError};
use crate::facilities::PoolService;

/// Returns the pool the dataset should live on: the forced pool if one is
/// set, else the stored pool, else the default (boot) pool.
pub fn resolve_effective_pool<'a>(
    stored: &'a str,
    forced: Option<&'a str>,
    default: &'a str,
) -> &'a str {
    match forced {
        Some(forced) if !forced.is_empty() => forced,
        _ if !stored.is_empty() => stored,
        _ => default,
    }
}

/// Space a destination must have free to receive a dataset using `used`
/// bytes, leaving a 10% margin since the same files rarely occupy exactly the
/// same space on another pool.
pub fn required_space(used: u64) -> u64 {
    let required = u128::from(used) * 11 / 10;
    u64::try_from(required).unwrap_or(u64::MAX)
}

/// True if `pool` may be picked automatically: it is not `exclude` and its
/// root dataset is neither passphrase-keyed nor locked.
async fn is_eligible(
    pools: &dyn PoolService,
    pool: &str,
    exclude: Option<&str>,
) -> Result<bool, Error> {
    if exclude == Some(pool) {
        return Ok(false);
    }
    let locked = pools
        .root_is_locked_or_passphrase(pool)
        .await
        .map_err(|err| Error::facility(format!("inspect pool {pool}"), err))?;
    Ok(!locked)
}

/// Filters `candidates` down to the pools automatic selection may use,
/// preserving their order.
pub async fn eligible_pools(
    pools: &dyn PoolService,
    candidates: &[String],
    exclude: Option<&str>,
) -> Result<Vec<String>, Error> {
    let mut eligible = Vec::new();
    for pool in candidates {
        if is_eligible(pools, pool, exclude).await? {
            eligible.push(pool.clone());
        }
    }
    Ok(eligible)
}

/// Returns the first of `candidates` that automatic selection may use.
///
/// `None` means no pool qualifies and the boot pool should be used.
pub async fn pick_automatic_pool(
    pools: &dyn PoolService,
    candidates: &[String],
    exclude: Option<&str>,
) -> Result<Option<String>, Error> {
    for pool in candidates {
        if is_eligible(pools, pool, exclude).await? {
            return Ok(Some(pool.clone()));
        }
    }
    Ok(None)
}

/// Checks that the dataset currently named `basename` would fit on `dest`.
///
/// Succeeds trivially if there is no existing dataset to move.
pub async fn check_destination_feasible(
    pools: &dyn PoolService,
    basename: &str,
    dest: &str,
) -> Result<(), Error> {
    let Some(existing) = pools
        .get_dataset(basename)
        .await
        .map_err(|err| Error::facility(format!("inspect {basename}"), err))?
    else {
        return Ok(());
    };
    let used = existing.used().unwrap_or(0);

    let Some(destination) = pools
        .get_dataset(dest)
        .await
        .map_err(|err| Error::facility(format!("inspect pool {dest}"), err))?
    else {
        return Err(ValidationError::PoolNotFound(dest.to_string()).into());
    };
    let available = destination.available().unwrap_or(0);

    let required = required_space(used);
    if available < required {
        return Err(ValidationError::InsufficientSpace {
            pool: dest.to_string(),
            available,
            required,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakePools;
    use assert_matches::assert_matches;

    const GIB: u64 = 1 << 30;

    #[test]
    fn forced_pool_wins_over_stored_pool() {
        assert_eq!(resolve_effective_pool("tank", Some("boot"), "boot"), "boot");
        assert_eq!(resolve_effective_pool("tank", None, "boot"), "tank");
        assert_eq!(resolve_effective_pool("", None, "boot"), "boot");
        assert_eq!(resolve_effective_pool("", Some(""), "boot"), "boot");
    }

    #[tokio::test]
    async fn locked_and_passphrase_pools_are_never_picked() {
        let pools = FakePools::new("boot-pool");
        pools.add_pool("locked", 10 * GIB);
        pools.lock_pool("locked");
        pools.add_pool("secret", 10 * GIB);
        pools.set_property("secret", "keyformat", "passphrase");

        let only_locked = vec!["locked".to_string()];
        assert_eq!(
            pick_automatic_pool(&pools, &only_locked, None).await.unwrap(),
            None
        );
        let all = pools.pool_names();
        assert_eq!(pick_automatic_pool(&pools, &all, None).await.unwrap(), None);
        assert!(eligible_pools(&pools, &all, None).await.unwrap().is_empty());

        pools.add_pool("tank", 10 * GIB);
        pools.add_pool("backup", 10 * GIB);
        let all = pools.pool_names();
        assert_eq!(
            eligible_pools(&pools, &all, None).await.unwrap(),
            vec!["tank".to_string(), "backup".to_string()]
        );
        assert_eq!(
            eligible_pools(&pools, &all, Some("tank")).await.unwrap(),
            vec!["backup".to_string()]
        );
        assert_eq!(
            pick_automatic_pool(&pools, &all, None).await.unwrap(),
            Some("tank".to_string())
        );
        assert_eq!(
            pick_automatic_pool(&pools, &all, Some("tank")).await.unwrap(),
            Some("backup".to_string())
        );
    }

    #[tokio::test]
    async fn feasibility_applies_a_ten_percent_margin() {
        let pools = FakePools::new("boot-pool");
        pools.add_pool("tank", 10 * GIB);
        pools.add_dataset("tank/.system", GIB);
        pools.add_pool("backup", 2 * GIB);
        pools.add_pool("small", GIB / 2);

        check_destination_feasible(&pools, "tank/.system", "backup")
            .await
            .unwrap();

        let err = check_destination_feasible(&pools, "tank/.system", "small")
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Validation(ValidationError::InsufficientSpace {
                pool,
                available,
                required,
            }) => {
                assert_eq!(pool, "small");
                assert_eq!(available, GIB / 2);
                assert_eq!(required, GIB * 11 / 10);
            }
        );

        assert_matches!(
            check_destination_feasible(&pools, "tank/.system", "absent").await,
            Err(Error::Validation(ValidationError::PoolNotFound(name)))
                if name == "absent"
        );
    }

    #[tokio::test]
    async fn nothing_to_move_is_always_feasible() {
        let pools = FakePools::new("boot-pool");
        pools.add_pool("small", 0);
        check_destination_feasible(&pools, "tank/.system", "small")
            .await
            .unwrap();
        check_destination_feasible(&pools, "tank/.system", "absent")
            .await
            .unwrap();
    }
}
