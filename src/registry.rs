use crate::errors::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// One registry user and the devices it owns.
#[derive(Debug, Clone)]
pub struct UserDevices {
    pub user_id: String,
    pub device_ids: Vec<String>,
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to device registry...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Registry connection established");
    Ok(pool)
}

/// Loads every user together with its device ids. Users without devices come
/// back with an empty list; the fleet decides what to do with them.
pub async fn load_users(pool: &PgPool) -> Result<Vec<UserDevices>> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT u.id, d.id
        FROM users u
        LEFT JOIN devices d ON d.user_id = u.id
        ORDER BY u.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(group_rows(rows))
}

/// Folds the LEFT JOIN rows (ordered by user id) into one entry per user.
fn group_rows(rows: Vec<(String, Option<String>)>) -> Vec<UserDevices> {
    let mut users: Vec<UserDevices> = Vec::new();
    for (user_id, device_id) in rows {
        match users.last_mut() {
            Some(user) if user.user_id == user_id => {
                if let Some(device_id) = device_id {
                    user.device_ids.push(device_id);
                }
            }
            _ => users.push(UserDevices {
                user_id,
                device_ids: device_id.into_iter().collect(),
            }),
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, device: Option<&str>) -> (String, Option<String>) {
        (user.to_string(), device.map(|d| d.to_string()))
    }

    #[test]
    fn test_group_rows_collects_devices_per_user() {
        let rows = vec![
            row("u-1", Some("d-1")),
            row("u-1", Some("d-2")),
            row("u-2", Some("d-3")),
        ];

        let users = group_rows(rows);

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "u-1");
        assert_eq!(users[0].device_ids, ["d-1", "d-2"]);
        assert_eq!(users[1].user_id, "u-2");
        assert_eq!(users[1].device_ids, ["d-3"]);
    }

    #[test]
    fn test_group_rows_keeps_deviceless_users() {
        let rows = vec![row("u-1", None), row("u-2", Some("d-1"))];

        let users = group_rows(rows);

        assert_eq!(users.len(), 2);
        assert!(users[0].device_ids.is_empty());
        assert_eq!(users[1].device_ids, ["d-1"]);
    }

    #[test]
    fn test_group_rows_empty() {
        assert!(group_rows(Vec::new()).is_empty());
    }
}
