use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "campus.sqlite3";

/// Audit and soft-delete columns shared by every mutable record.
const AUDIT_COLUMNS: &str = "
    mod_flag INTEGER NOT NULL DEFAULT 0,
    del_flag INTEGER NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL DEFAULT 'system',
    modified_by TEXT,
    action_type TEXT NOT NULL DEFAULT 'create',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema.
#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Splits a column list at its first table constraint, so audit columns can
/// be slotted in before `FOREIGN KEY`/`UNIQUE` clauses.
fn split_constraints(columns: &str) -> (&str, Option<&str>) {
    const KEYWORDS: [&str; 5] = ["FOREIGN KEY", "UNIQUE", "PRIMARY KEY", "CHECK", "CONSTRAINT"];
    let mut depth = 0i32;
    for (i, ch) in columns.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                let rest = columns[i + 1..].trim_start();
                if KEYWORDS.iter().any(|k| rest.starts_with(k)) {
                    return (&columns[..i], Some(rest));
                }
            }
            _ => {}
        }
    }
    (columns, None)
}

fn table_sql(name: &str, columns: &str, audited: bool) -> String {
    if !audited {
        return format!("CREATE TABLE IF NOT EXISTS {name}({columns})");
    }
    match split_constraints(columns) {
        (cols, Some(constraints)) => format!(
            "CREATE TABLE IF NOT EXISTS {name}({cols},{audit},\n         {constraints})",
            audit = AUDIT_COLUMNS
        ),
        (cols, None) => format!(
            "CREATE TABLE IF NOT EXISTS {name}({cols},{audit})",
            audit = AUDIT_COLUMNS
        ),
    }
}

fn create_table(conn: &Connection, name: &str, columns: &str, audited: bool) -> anyhow::Result<()> {
    conn.execute(&table_sql(name, columns, audited), [])
        .with_context(|| format!("failed to create table {name}"))?;
    Ok(())
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    create_table(
        conn,
        "schools",
        "id TEXT PRIMARY KEY,
         name TEXT NOT NULL,
         code TEXT NOT NULL,
         address TEXT,
         phone TEXT,
         email TEXT,
         academic_year_start_month INTEGER NOT NULL DEFAULT 4",
        true,
    )?;

    create_table(
        conn,
        "users",
        "id TEXT PRIMARY KEY,
         school_id TEXT,
         username TEXT NOT NULL,
         password_hash TEXT NOT NULL,
         password_salt TEXT NOT NULL,
         display_name TEXT NOT NULL,
         is_super_admin INTEGER NOT NULL DEFAULT 0,
         is_admin INTEGER NOT NULL DEFAULT 0,
         is_teacher INTEGER NOT NULL DEFAULT 0,
         is_accountant INTEGER NOT NULL DEFAULT 0,
         is_inventory_manager INTEGER NOT NULL DEFAULT 0,
         is_student INTEGER NOT NULL DEFAULT 0,
         is_parent INTEGER NOT NULL DEFAULT 0,
         student_id TEXT,
         employee_id TEXT,
         active INTEGER NOT NULL DEFAULT 1,
         last_login_at TEXT,
         FOREIGN KEY(school_id) REFERENCES schools(id)",
        true,
    )?;

    create_table(
        conn,
        "employees",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         employee_no TEXT NOT NULL,
         first_name TEXT NOT NULL,
         last_name TEXT NOT NULL,
         designation TEXT NOT NULL,
         department TEXT,
         join_date TEXT,
         phone TEXT,
         email TEXT,
         basic_salary REAL NOT NULL DEFAULT 0,
         allowances REAL NOT NULL DEFAULT 0,
         deductions REAL NOT NULL DEFAULT 0,
         active INTEGER NOT NULL DEFAULT 1,
         FOREIGN KEY(school_id) REFERENCES schools(id)",
        true,
    )?;

    create_table(
        conn,
        "classes",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         name TEXT NOT NULL,
         section TEXT NOT NULL DEFAULT '',
         capacity INTEGER,
         class_teacher_id TEXT,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(class_teacher_id) REFERENCES employees(id)",
        true,
    )?;

    create_table(
        conn,
        "students",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         class_id TEXT NOT NULL,
         admission_no TEXT NOT NULL,
         first_name TEXT NOT NULL,
         last_name TEXT NOT NULL,
         gender TEXT,
         birth_date TEXT,
         guardian_name TEXT,
         guardian_phone TEXT,
         roll_no INTEGER,
         active INTEGER NOT NULL DEFAULT 1,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(class_id) REFERENCES classes(id)",
        true,
    )?;

    create_table(
        conn,
        "attendance",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         class_id TEXT NOT NULL,
         date TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(class_id) REFERENCES classes(id),
         UNIQUE(class_id, date)",
        true,
    )?;
    create_table(
        conn,
        "attendance_entries",
        "attendance_id TEXT NOT NULL,
         student_id TEXT NOT NULL,
         status TEXT NOT NULL,
         remark TEXT,
         PRIMARY KEY(attendance_id, student_id),
         FOREIGN KEY(attendance_id) REFERENCES attendance(id),
         FOREIGN KEY(student_id) REFERENCES students(id)",
        false,
    )?;

    create_table(
        conn,
        "fee_heads",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         class_id TEXT,
         name TEXT NOT NULL,
         amount REAL NOT NULL,
         frequency TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(class_id) REFERENCES classes(id)",
        true,
    )?;

    create_table(
        conn,
        "accounts",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         name TEXT NOT NULL,
         kind TEXT NOT NULL,
         opening_balance REAL NOT NULL DEFAULT 0,
         FOREIGN KEY(school_id) REFERENCES schools(id)",
        true,
    )?;
    create_table(
        conn,
        "account_transactions",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         account_id TEXT NOT NULL,
         txn_date TEXT NOT NULL,
         direction TEXT NOT NULL,
         amount REAL NOT NULL,
         source TEXT NOT NULL,
         source_id TEXT,
         memo TEXT,
         created_by TEXT NOT NULL,
         created_at TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(account_id) REFERENCES accounts(id)",
        false,
    )?;

    create_table(
        conn,
        "fee_payments",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         student_id TEXT NOT NULL,
         receipt_no TEXT NOT NULL,
         paid_on TEXT NOT NULL,
         method TEXT NOT NULL,
         account_id TEXT,
         total REAL NOT NULL,
         remark TEXT,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(student_id) REFERENCES students(id),
         FOREIGN KEY(account_id) REFERENCES accounts(id)",
        true,
    )?;
    create_table(
        conn,
        "fee_payment_lines",
        "id TEXT PRIMARY KEY,
         payment_id TEXT NOT NULL,
         fee_head_id TEXT NOT NULL,
         period TEXT NOT NULL,
         fee_amount REAL NOT NULL,
         discount REAL NOT NULL DEFAULT 0,
         paid_amount REAL NOT NULL,
         FOREIGN KEY(payment_id) REFERENCES fee_payments(id),
         FOREIGN KEY(fee_head_id) REFERENCES fee_heads(id)",
        false,
    )?;

    create_table(
        conn,
        "inventory_categories",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         name TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id)",
        true,
    )?;
    create_table(
        conn,
        "inventory_items",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         category_id TEXT NOT NULL,
         name TEXT NOT NULL,
         unit TEXT NOT NULL,
         quantity REAL NOT NULL DEFAULT 0,
         reorder_level REAL NOT NULL DEFAULT 0,
         unit_price REAL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(category_id) REFERENCES inventory_categories(id)",
        true,
    )?;
    create_table(
        conn,
        "inventory_movements",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         item_id TEXT NOT NULL,
         kind TEXT NOT NULL,
         quantity REAL NOT NULL,
         balance_after REAL NOT NULL,
         party TEXT,
         note TEXT,
         moved_on TEXT NOT NULL,
         created_by TEXT NOT NULL,
         created_at TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(item_id) REFERENCES inventory_items(id)",
        false,
    )?;

    create_table(
        conn,
        "payslips",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         employee_id TEXT NOT NULL,
         month TEXT NOT NULL,
         basic REAL NOT NULL,
         allowances REAL NOT NULL,
         deductions REAL NOT NULL,
         net REAL NOT NULL,
         status TEXT NOT NULL DEFAULT 'pending',
         paid_on TEXT,
         account_id TEXT,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(employee_id) REFERENCES employees(id),
         FOREIGN KEY(account_id) REFERENCES accounts(id),
         UNIQUE(employee_id, month)",
        true,
    )?;

    create_table(
        conn,
        "messages",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         sender_id TEXT NOT NULL,
         audience TEXT NOT NULL,
         audience_ref TEXT,
         subject TEXT NOT NULL,
         body TEXT NOT NULL,
         FOREIGN KEY(school_id) REFERENCES schools(id),
         FOREIGN KEY(sender_id) REFERENCES users(id)",
        true,
    )?;
    create_table(
        conn,
        "message_reads",
        "message_id TEXT NOT NULL,
         user_id TEXT NOT NULL,
         read_at TEXT NOT NULL,
         PRIMARY KEY(message_id, user_id),
         FOREIGN KEY(message_id) REFERENCES messages(id),
         FOREIGN KEY(user_id) REFERENCES users(id)",
        false,
    )?;

    create_table(
        conn,
        "events",
        "id TEXT PRIMARY KEY,
         school_id TEXT NOT NULL,
         title TEXT NOT NULL,
         description TEXT,
         category TEXT,
         starts_at TEXT NOT NULL,
         ends_at TEXT NOT NULL,
         all_day INTEGER NOT NULL DEFAULT 0,
         FOREIGN KEY(school_id) REFERENCES schools(id)",
        true,
    )?;

    create_table(
        conn,
        "settings",
        "key TEXT PRIMARY KEY,
         value_json TEXT NOT NULL",
        false,
    )?;

    for sql in [
        "CREATE INDEX IF NOT EXISTS idx_users_school ON users(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        "CREATE INDEX IF NOT EXISTS idx_employees_school ON employees(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, date)",
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        "CREATE INDEX IF NOT EXISTS idx_fee_heads_school ON fee_heads(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_student ON fee_payments(student_id)",
        "CREATE INDEX IF NOT EXISTS idx_fee_payment_lines_payment ON fee_payment_lines(payment_id)",
        "CREATE INDEX IF NOT EXISTS idx_fee_payment_lines_head ON fee_payment_lines(fee_head_id, period)",
        "CREATE INDEX IF NOT EXISTS idx_account_txns_account ON account_transactions(account_id)",
        "CREATE INDEX IF NOT EXISTS idx_inventory_items_school ON inventory_items(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_inventory_movements_item ON inventory_movements(item_id)",
        "CREATE INDEX IF NOT EXISTS idx_payslips_school_month ON payslips(school_id, month)",
        "CREATE INDEX IF NOT EXISTS idx_messages_school ON messages(school_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_school_start ON events(school_id, starts_at)",
    ] {
        conn.execute(sql, [])?;
    }

    Ok(())
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before guardian contact fields were tracked.
    if !table_has_column(conn, "students", "guardian_phone")? {
        conn.execute("ALTER TABLE students ADD COLUMN guardian_phone TEXT", [])?;
    }
    if !table_has_column(conn, "users", "last_login_at")? {
        conn.execute("ALTER TABLE users ADD COLUMN last_login_at TEXT", [])?;
    }
    settings_set_json(
        conn,
        "schema.version",
        &serde_json::json!({ "version": SCHEMA_VERSION }),
    )?;
    Ok(())
}

pub const SCHEMA_VERSION: i64 = 1;

#[cfg(test)]
fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent_and_records_version() {
        let conn = open_in_memory().expect("open");
        create_schema(&conn).expect("second create");
        migrate(&conn).expect("second migrate");
        let v = settings_get_json(&conn, "schema.version")
            .expect("read")
            .expect("present");
        assert_eq!(v["version"], SCHEMA_VERSION);
    }

    #[test]
    fn audited_tables_carry_soft_delete_columns() {
        let conn = open_in_memory().expect("open");
        for table in ["schools", "students", "employees", "fee_payments", "events"] {
            assert!(table_has_column(&conn, table, "del_flag").unwrap(), "{table}");
            assert!(table_has_column(&conn, table, "action_type").unwrap(), "{table}");
        }
        assert!(!table_has_column(&conn, "attendance_entries", "del_flag").unwrap());
    }

    #[test]
    fn audit_columns_precede_table_constraints() {
        let sql = table_sql(
            "t",
            "id TEXT PRIMARY KEY,
         amount REAL CHECK(amount >= 0),
         FOREIGN KEY(id) REFERENCES other(id),
         UNIQUE(id, amount)",
            true,
        );
        let audit = sql.find("mod_flag").expect("audit columns");
        let fk = sql.find("FOREIGN KEY").expect("constraint");
        assert!(audit < fk, "{sql}");
        assert!(sql.contains("CHECK(amount >= 0),"));

        let plain = table_sql("u", "id TEXT PRIMARY KEY", true);
        assert!(plain.ends_with("updated_at TEXT NOT NULL)"));
    }
}
