//! In-memory accounts and users service behind the standard pipeline.
//!
//! Run with:
//!   PORTICO_ENV=development cargo run --example accounts
//!
//! Try:
//!   curl http://localhost:3000/api/accounts
//!   curl http://localhost:3000/api/accounts/active
//!   curl http://localhost:3000/api/accounts/by-type/savings
//!   curl http://localhost:3000/api/accounts/404          # 404 error envelope
//!   curl http://localhost:3000/api/accounts/abc          # 400 error envelope
//!   curl -X POST http://localhost:3000/api/accounts \
//!        -H 'content-type: application/json' \
//!        -d '{"accountName":"holiday fund","accountType":"savings","balance":120.5}'
//!   curl -X POST http://localhost:3000/api/accounts \
//!        -H 'content-type: text/plain' -d 'nope'           # rejected by validation
//!   curl -X DELETE http://localhost:3000/api/accounts/1  # 204
//!
//! Every response to a rate-limited route carries `X-RateLimit-*` headers;
//! the 101st request inside a minute gets a 429.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use portico::{Config, Fault, Handler, IntoOutcome, Json, Pipeline, Request, Response, Router, Server, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> Result<(), portico::Error> {
    let config = Config::from_env()?;
    portico::telemetry::init(config.server.environment);

    let store = Arc::new(Store::seeded());

    let app = Router::new()
        .get("/api/accounts",                        with(&store, list_accounts))
        .get("/api/accounts/active",                 with(&store, active_accounts))
        .get("/api/accounts/by-type/{account_type}", with(&store, accounts_by_type))
        .get("/api/accounts/{id}",                   with(&store, get_account))
        .post("/api/accounts",                       with(&store, create_account))
        .put("/api/accounts/{id}",                   with(&store, update_account))
        .delete("/api/accounts/{id}",                with(&store, delete_account))
        .get("/api/users",                           with(&store, list_users))
        .get("/api/users/{id}",                      with(&store, get_user))
        .post("/api/users",                          with(&store, create_user))
        .put("/api/users/{id}",                      with(&store, update_user))
        .delete("/api/users/{id}",                   with(&store, delete_user));

    Server::try_bind(&config.server.address)?
        .serve(Pipeline::standard(app, &config))
        .await
}

/// Adapts a store-taking function into a plain request handler.
fn with<F, Fut, R>(store: &Arc<Store>, f: F) -> impl Handler
where
    F: Fn(Arc<Store>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    let store = Arc::clone(store);
    move |req: Request| f(Arc::clone(&store), req)
}

// ── Model ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    id: i64,
    account_name: String,
    account_type: String,
    balance: f64,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInput {
    account_name: String,
    account_type: String,
    #[serde(default)]
    balance: f64,
    #[serde(default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

impl AccountInput {
    fn check(&self) -> Result<(), Fault> {
        if self.account_name.trim().is_empty() {
            return Err(Fault::invalid_argument("accountName must not be blank"));
        }
        if self.account_type.trim().is_empty() {
            return Err(Fault::invalid_argument("accountType must not be blank"));
        }
        if !self.balance.is_finite() {
            return Err(Fault::invalid_argument("balance must be a finite number"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct User {
    id: i64,
    username: String,
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInput {
    username: String,
    email: String,
    full_name: Option<String>,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    users: BTreeMap<i64, User>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Store {
    tables: RwLock<Tables>,
}

impl Store {
    fn seeded() -> Self {
        let now = Utc::now();
        let mut tables = Tables::default();
        for (name, kind, balance, active) in [
            ("everyday", "checking", 1_250.00, true),
            ("rainy day", "savings", 9_800.50, true),
            ("old card", "credit", -42.10, false),
        ] {
            let id = tables.next_id();
            tables.accounts.insert(id, Account {
                id,
                account_name: name.to_owned(),
                account_type: kind.to_owned(),
                balance,
                is_active: active,
                created_at: now,
                updated_at: now,
            });
        }
        let id = tables.next_id();
        tables.users.insert(id, User {
            id,
            username: "alice".to_owned(),
            email: "alice@example.com".to_owned(),
            full_name: Some("Alice Liddell".to_owned()),
            created_at: now,
            updated_at: now,
        });
        Self { tables: RwLock::new(tables) }
    }
}

fn id_param(req: &Request) -> Result<i64, Fault> {
    let raw = req.param("id").ok_or_else(|| Fault::missing_input("id"))?;
    raw.parse()
        .map_err(|_| Fault::invalid_argument(format!("id `{raw}` is not an integer")))
}

fn created<T: Serialize>(location: String, body: &T) -> Result<Response, Fault> {
    let body = serde_json::to_vec(body).map_err(anyhow::Error::from)?;
    Ok(Response::builder()
        .status(Status::CREATED)
        .header("location", &location)
        .json(body))
}

// ── Accounts ──────────────────────────────────────────────────────────────────

async fn list_accounts(store: Arc<Store>, _req: Request) -> Json<Vec<Account>> {
    Json(store.tables.read().await.accounts.values().cloned().collect())
}

async fn active_accounts(store: Arc<Store>, _req: Request) -> Json<Vec<Account>> {
    let tables = store.tables.read().await;
    Json(tables.accounts.values().filter(|a| a.is_active).cloned().collect())
}

async fn accounts_by_type(store: Arc<Store>, req: Request) -> Result<Json<Vec<Account>>, Fault> {
    let kind = req.param("account_type").ok_or_else(|| Fault::missing_input("account_type"))?;
    let tables = store.tables.read().await;
    Ok(Json(
        tables.accounts.values()
            .filter(|a| a.account_type.eq_ignore_ascii_case(kind))
            .cloned()
            .collect(),
    ))
}

async fn get_account(store: Arc<Store>, req: Request) -> Result<Json<Account>, Fault> {
    let id = id_param(&req)?;
    let tables = store.tables.read().await;
    let account = tables.accounts.get(&id).ok_or_else(|| Fault::not_found(format!("account {id}")))?;
    Ok(Json(account.clone()))
}

async fn create_account(store: Arc<Store>, req: Request) -> Result<Response, Fault> {
    let input: AccountInput = req.json()?;
    input.check()?;

    let now = Utc::now();
    let mut tables = store.tables.write().await;
    let id = tables.next_id();
    let account = Account {
        id,
        account_name: input.account_name,
        account_type: input.account_type,
        balance: input.balance,
        is_active: input.is_active,
        created_at: now,
        updated_at: now,
    };
    tables.accounts.insert(id, account.clone());
    created(format!("/api/accounts/{id}"), &account)
}

async fn update_account(store: Arc<Store>, req: Request) -> Result<Json<Account>, Fault> {
    let id = id_param(&req)?;
    let input: AccountInput = req.json()?;
    input.check()?;

    let mut tables = store.tables.write().await;
    let account = tables.accounts.get_mut(&id).ok_or_else(|| Fault::not_found(format!("account {id}")))?;
    account.account_name = input.account_name;
    account.account_type = input.account_type;
    account.balance = input.balance;
    account.is_active = input.is_active;
    account.updated_at = Utc::now();
    Ok(Json(account.clone()))
}

async fn delete_account(store: Arc<Store>, req: Request) -> Result<Status, Fault> {
    let id = id_param(&req)?;
    match store.tables.write().await.accounts.remove(&id) {
        Some(_) => Ok(Status::NO_CONTENT),
        None => Err(Fault::not_found(format!("account {id}"))),
    }
}

// ── Users ─────────────────────────────────────────────────────────────────────

async fn list_users(store: Arc<Store>, _req: Request) -> Json<Vec<User>> {
    Json(store.tables.read().await.users.values().cloned().collect())
}

async fn get_user(store: Arc<Store>, req: Request) -> Result<Json<User>, Fault> {
    let id = id_param(&req)?;
    let tables = store.tables.read().await;
    let user = tables.users.get(&id).ok_or_else(|| Fault::not_found(format!("user {id}")))?;
    Ok(Json(user.clone()))
}

impl UserInput {
    fn check(&self) -> Result<(), Fault> {
        if self.username.trim().is_empty() {
            return Err(Fault::invalid_argument("username must not be blank"));
        }
        if !self.email.contains('@') {
            return Err(Fault::invalid_argument(format!("`{}` is not an email address", self.email)));
        }
        Ok(())
    }
}

async fn create_user(store: Arc<Store>, req: Request) -> Result<Response, Fault> {
    let input: UserInput = req.json()?;
    input.check()?;

    let now = Utc::now();
    let mut tables = store.tables.write().await;
    if tables.users.values().any(|u| u.username == input.username) {
        return Err(Fault::invalid_argument(format!("username `{}` is taken", input.username)));
    }
    let id = tables.next_id();
    let user = User {
        id,
        username: input.username,
        email: input.email,
        full_name: input.full_name,
        created_at: now,
        updated_at: now,
    };
    tables.users.insert(id, user.clone());
    created(format!("/api/users/{id}"), &user)
}

async fn update_user(store: Arc<Store>, req: Request) -> Result<Json<User>, Fault> {
    let id = id_param(&req)?;
    let input: UserInput = req.json()?;
    input.check()?;

    let mut tables = store.tables.write().await;
    if tables.users.values().any(|u| u.id != id && u.username == input.username) {
        return Err(Fault::invalid_argument(format!("username `{}` is taken", input.username)));
    }
    let user = tables.users.get_mut(&id).ok_or_else(|| Fault::not_found(format!("user {id}")))?;
    user.username = input.username;
    user.email = input.email;
    user.full_name = input.full_name;
    user.updated_at = Utc::now();
    Ok(Json(user.clone()))
}

async fn delete_user(store: Arc<Store>, req: Request) -> Result<Status, Fault> {
    let id = id_param(&req)?;
    match store.tables.write().await.users.remove(&id) {
        Some(_) => Ok(Status::NO_CONTENT),
        None => Err(Fault::not_found(format!("user {id}"))),
    }
}
