use crate::calc::{self, AccountKind, Direction};
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, exists, include_deleted, new_id, now, optional_date,
    optional_f64, optional_str, patch_obj, query_json, required_date, required_f64, required_str,
    school_ref, soft_delete, with_audit, Action, Ctx, PatchSet, AUDIT_COLS,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

/// Where a ledger posting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Manual,
    FeePayment,
    FeePaymentVoid,
    Payroll,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::FeePayment => "fee_payment",
            Self::FeePaymentVoid => "fee_payment_void",
            Self::Payroll => "payroll",
        }
    }
}

pub struct Posting<'a> {
    pub school_id: &'a str,
    pub account_id: &'a str,
    pub date: &'a str,
    pub direction: Direction,
    pub amount: f64,
    pub source: Source,
    pub source_id: Option<&'a str>,
    pub memo: Option<&'a str>,
}

/// Appends one transaction to an account's ledger.
pub fn post(conn: &Connection, p: &Posting<'_>, actor: &str) -> Result<String, ActionError> {
    if p.amount <= 0.0 {
        return Err(ActionError::invalid("amount", "amount must be greater than zero"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO account_transactions(id, school_id, account_id, txn_date, direction, amount,
                                          source, source_id, memo, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            p.school_id,
            p.account_id,
            p.date,
            p.direction.as_str(),
            calc::round_money(p.amount),
            p.source.as_str(),
            p.source_id,
            p.memo,
            actor,
            now(),
        ],
    )?;
    tracing::info!(txn_id = %id, account_id = %p.account_id, direction = p.direction.as_str(), amount = p.amount, source = p.source.as_str(), "ledger entry posted");
    Ok(id)
}

/// Posts the opposite of every entry `source` recorded for `source_id`.
pub fn reverse_postings(
    conn: &Connection,
    source: Source,
    source_id: &str,
    reversal: Source,
    date: &str,
    actor: &str,
) -> Result<usize, ActionError> {
    let originals: Vec<(String, String, String, f64)> = {
        let mut stmt = conn.prepare(
            "SELECT school_id, account_id, direction, amount
             FROM account_transactions WHERE source = ? AND source_id = ?",
        )?;
        let rows = stmt.query_map((source.as_str(), source_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let memo = format!("reversal of {}", source.as_str());
    for (school_id, account_id, direction, amount) in &originals {
        let direction = Direction::parse(direction)
            .ok_or_else(|| anyhow::anyhow!("bad direction {direction} in ledger"))?;
        post(
            conn,
            &Posting {
                school_id,
                account_id,
                date,
                direction: direction.reversed(),
                amount: *amount,
                source: reversal,
                source_id: Some(source_id),
                memo: Some(&memo),
            },
            actor,
        )?;
    }
    Ok(originals.len())
}

fn parse_kind(raw: &str) -> Result<AccountKind, ActionError> {
    AccountKind::parse(raw).ok_or_else(|| {
        ActionError::invalid("kind", "kind must be one of: asset, liability, equity, income, expense")
    })
}

/// Opening balance plus every posting dated strictly before `before` (all when `None`).
fn balance_as_of(
    conn: &Connection,
    account_id: &str,
    kind: AccountKind,
    opening: f64,
    before: Option<&str>,
) -> Result<f64, ActionError> {
    let (debits, credits): (f64, f64) = conn.query_row(
        "SELECT
           COALESCE(SUM(CASE WHEN direction = 'debit' THEN amount END), 0),
           COALESCE(SUM(CASE WHEN direction = 'credit' THEN amount END), 0)
         FROM account_transactions
         WHERE account_id = ?1 AND (?2 IS NULL OR txn_date < ?2)",
        rusqlite::params![account_id, before],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(calc::round_money(
        opening
            + calc::balance_effect(kind, Direction::Debit, debits)
            + calc::balance_effect(kind, Direction::Credit, credits),
    ))
}

fn account_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "kind": r.get::<_, String>(3)?,
            "openingBalance": r.get::<_, f64>(4)?,
        }),
        r,
        5,
    )
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT id, school_id, name, kind, opening_balance, {AUDIT_COLS}
         FROM accounts {filter}"
    )
}

fn with_balance(conn: &Connection, mut account: Value) -> Result<Value, ActionError> {
    let id = account["id"].as_str().unwrap_or_default().to_string();
    let kind = account["kind"].as_str().and_then(AccountKind::parse).unwrap_or(AccountKind::Asset);
    let opening = account["openingBalance"].as_f64().unwrap_or(0.0);
    let balance = balance_as_of(conn, &id, kind, opening, None)?;
    account["balance"] = json!(balance);
    Ok(account)
}

fn load_account(conn: &Connection, account_id: &str, school_id: &str) -> Result<Value, ActionError> {
    let account = conn
        .query_row(
            &select_sql("WHERE id = ? AND school_id = ? AND del_flag = 0"),
            (account_id, school_id),
            account_json,
        )
        .optional()?
        .ok_or_else(|| ActionError::not_found("account"))?;
    with_balance(conn, account)
}

fn name_taken(conn: &Connection, school_id: &str, name: &str, except_id: &str) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM accounts
         WHERE school_id = ? AND name = ? COLLATE NOCASE AND del_flag = 0 AND id <> ?",
        (school_id, name, except_id),
    )
}

fn accounts_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let deleted = if include_deleted(params) { "" } else { "AND del_flag = 0" };
    let rows = query_json(
        ctx.conn,
        &select_sql(&format!("WHERE school_id = ? {deleted} ORDER BY kind, name")),
        [&school.id],
        account_json,
    )?;
    let accounts = rows
        .into_iter()
        .map(|a| with_balance(ctx.conn, a))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "accounts": accounts, "currency": ctx.settings.fees.currency }))
}

fn accounts_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let name = required_str(params, "name")?;
    let kind = parse_kind(&required_str(params, "kind")?)?;
    let opening = calc::round_money(optional_f64(params, "openingBalance")?.unwrap_or(0.0));
    if name_taken(ctx.conn, &school.id, &name, "")? {
        return Err(ActionError::conflict(format!("account {name} already exists")));
    }

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO accounts(id, school_id, name, kind, opening_balance, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (&id, &school.id, &name, kind.as_str(), opening, &actor, &ts, &ts),
    )?;
    tracing::info!(account_id = %id, school_id = %school.id, kind = kind.as_str(), "account created");
    Ok(json!({ "accountId": id, "account": load_account(ctx.conn, &id, &school.id)? }))
}

fn accounts_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let account_id = required_str(params, "accountId")?;
    load_account(ctx.conn, &account_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    if let Some(name) = set.text("name", "name")? {
        if name_taken(ctx.conn, &school.id, &name, &account_id)? {
            return Err(ActionError::conflict(format!("account {name} already exists")));
        }
    }
    if let Some(raw) = patch.get("kind") {
        let kind = parse_kind(raw.as_str().unwrap_or_default())?;
        set.push("kind", rusqlite::types::Value::Text(kind.as_str().to_string()));
    }
    set.real("openingBalance", "opening_balance", f64::MIN)?;
    set.apply(ctx.conn, "accounts", "account", &account_id, Some(&school.id), &actor)?;
    Ok(json!({ "account": load_account(ctx.conn, &account_id, &school.id)? }))
}

fn accounts_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let account_id = required_str(params, "accountId")?;
    soft_delete(ctx.conn, "accounts", "account", &account_id, Some(&school.id), &actor)?;
    tracing::info!(%account_id, school_id = %school.id, "account deleted");
    Ok(json!({ "ok": true }))
}

fn accounts_post_entry(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let account_id = required_str(params, "accountId")?;
    ensure_in_school(ctx.conn, "accounts", "account", &account_id, &school.id)?;
    let date = required_date(params, "date")?.format("%Y-%m-%d").to_string();
    let direction = Direction::parse(&required_str(params, "direction")?)
        .ok_or_else(|| ActionError::invalid("direction", "direction must be debit or credit"))?;
    let amount = required_f64(params, "amount")?;
    let memo = optional_str(params, "memo")?;
    let txn_id = post(
        ctx.conn,
        &Posting {
            school_id: &school.id,
            account_id: &account_id,
            date: &date,
            direction,
            amount,
            source: Source::Manual,
            source_id: None,
            memo: memo.as_deref(),
        },
        &actor,
    )?;
    Ok(json!({ "transactionId": txn_id, "account": load_account(ctx.conn, &account_id, &school.id)? }))
}

fn accounts_ledger(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let account_id = required_str(params, "accountId")?;
    let account = load_account(ctx.conn, &account_id, &school.id)?;
    let kind = account["kind"].as_str().and_then(AccountKind::parse).unwrap_or(AccountKind::Asset);
    let opening = account["openingBalance"].as_f64().unwrap_or(0.0);
    let from = optional_date(params, "from")?.map(|d| d.format("%Y-%m-%d").to_string());
    let to = optional_date(params, "to")?.map(|d| d.format("%Y-%m-%d").to_string());

    let start = match &from {
        Some(f) => balance_as_of(ctx.conn, &account_id, kind, opening, Some(f))?,
        None => opening,
    };
    let mut stmt = ctx.conn.prepare(
        "SELECT id, txn_date, direction, amount, source, source_id, memo, created_by, created_at
         FROM account_transactions
         WHERE account_id = ?1 AND (?2 IS NULL OR txn_date >= ?2) AND (?3 IS NULL OR txn_date <= ?3)
         ORDER BY txn_date, created_at, rowid",
    )?;
    let rows = stmt.query_map(rusqlite::params![account_id, from, to], |r| {
        Ok((
            r.get::<_, String>(2)?,
            r.get::<_, f64>(3)?,
            json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "direction": r.get::<_, String>(2)?,
                "amount": r.get::<_, f64>(3)?,
                "source": r.get::<_, String>(4)?,
                "sourceId": r.get::<_, Option<String>>(5)?,
                "memo": r.get::<_, Option<String>>(6)?,
                "createdBy": r.get::<_, String>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }),
        ))
    })?;
    let mut postings = Vec::new();
    let mut entries = Vec::new();
    for row in rows {
        let (direction, amount, entry) = row?;
        let direction = Direction::parse(&direction)
            .ok_or_else(|| anyhow::anyhow!("bad direction {direction} in ledger"))?;
        postings.push((direction, amount));
        entries.push(entry);
    }
    let balances = calc::running_balances(kind, start, &postings);
    for (entry, bal) in entries.iter_mut().zip(&balances) {
        entry["balance"] = json!(bal);
    }
    let closing = balances.last().copied().unwrap_or(start);
    Ok(json!({
        "account": account,
        "openingBalance": start,
        "closingBalance": closing,
        "entries": entries,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "accounts.list" => accounts_list,
        "accounts.create" => accounts_create,
        "accounts.update" => accounts_update,
        "accounts.delete" => accounts_delete,
        "accounts.postEntry" => accounts_post_entry,
        "accounts.ledger" => accounts_ledger,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
