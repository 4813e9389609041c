//! Creating and securing per-user databases on the remote.

use crate::auth::Credentials;
use crate::error::Result;
use crate::protocol::SecurityObject;
use crate::remote::{check_status, endpoint};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info};

/// Makes sure every database a user replicates into exists and only that
/// user can access it. Needs server admin credentials.
#[derive(Debug, Clone)]
pub struct RemoteProvisioner {
    http: Client,
    credentials: Credentials,
}

impl RemoteProvisioner {
    pub fn new(http: Client, admin: Credentials) -> Self {
        Self {
            http,
            credentials: admin,
        }
    }

    /// Create `db` if it does not exist. Returns whether it was created.
    pub async fn ensure_database(&self, base_url: &str, db: &str) -> Result<bool> {
        let url = endpoint(base_url, &[db])?;

        let head = self
            .credentials
            .apply(self.http.request(Method::HEAD, url.clone()))
            .send()
            .await?;
        if head.status().is_success() {
            debug!(db, "Database exists");
            return Ok(false);
        }
        if head.status() != StatusCode::NOT_FOUND {
            check_status(head, &url).await?;
        }

        let created = self
            .credentials
            .apply(self.http.request(Method::PUT, url.clone()))
            .send()
            .await?;
        // Someone else created it between the two requests.
        if created.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        check_status(created, &url).await?;
        info!(db, "Created database");
        Ok(true)
    }

    /// Make `user` the only member of `db`.
    pub async fn restrict_to(&self, base_url: &str, db: &str, user: &str) -> Result<()> {
        let url = endpoint(base_url, &[db, "_security"])?;
        let response = self
            .credentials
            .apply(self.http.request(Method::PUT, url.clone()))
            .json(&SecurityObject::sole_member(user))
            .send()
            .await?;
        check_status(response, &url).await?;
        debug!(db, user, "Restricted database to its owner");
        Ok(())
    }

    /// Ensure and secure every database in `dbs` for `user`. Returns the
    /// names of the databases that had to be created.
    pub async fn ensure_user_databases(
        &self,
        base_url: &str,
        user: &str,
        dbs: &[String],
    ) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for db in dbs {
            if self.ensure_database(base_url, db).await? {
                created.push(db.clone());
            }
            self.restrict_to(base_url, db, user).await?;
        }
        Ok(created)
    }
}
