use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleFlags {
    pub is_super_admin: bool,
    pub is_admin: bool,
    pub is_teacher: bool,
    pub is_accountant: bool,
    pub is_inventory_manager: bool,
    pub is_student: bool,
    pub is_parent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SuperAdmin,
    Admin,
    Teacher,
    Accountant,
    InventoryManager,
    Student,
    Parent,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::SuperAdmin,
        Role::Admin,
        Role::Teacher,
        Role::Accountant,
        Role::InventoryManager,
        Role::Student,
        Role::Parent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Accountant => "accountant",
            Self::InventoryManager => "inventory_manager",
            Self::Student => "student",
            Self::Parent => "parent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "super_admin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            "accountant" => Some(Self::Accountant),
            "inventory" | "inventory_manager" => Some(Self::InventoryManager),
            "student" => Some(Self::Student),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }
}

impl RoleFlags {
    pub fn has(&self, role: Role) -> bool {
        match role {
            Role::SuperAdmin => self.is_super_admin,
            Role::Admin => self.is_admin,
            Role::Teacher => self.is_teacher,
            Role::Accountant => self.is_accountant,
            Role::InventoryManager => self.is_inventory_manager,
            Role::Student => self.is_student,
            Role::Parent => self.is_parent,
        }
    }

    pub fn held(&self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|r| self.has(*r)).collect()
    }

    pub fn any(&self) -> bool {
        self.is_super_admin
            || self.is_admin
            || self.is_teacher
            || self.is_accountant
            || self.is_inventory_manager
            || self.is_student
            || self.is_parent
    }
}

pub struct MenuItem {
    pub key: &'static str,
    pub label: &'static str,
    pub href: &'static str,
    /// Empty means "any signed-in role".
    pub roles: &'static [Role],
    pub children: &'static [MenuItem],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuNode {
    pub key: String,
    pub label: String,
    pub href: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MenuNode>,
}

use Role::*;

const STAFF: &[Role] = &[Admin, Teacher, Accountant, InventoryManager];

pub static MENU: &[MenuItem] = &[
    MenuItem {
        key: "dashboard",
        label: "Dashboard",
        href: "/dashboard",
        roles: &[],
        children: &[],
    },
    MenuItem {
        key: "academics",
        label: "Academics",
        href: "",
        roles: &[Admin, Teacher],
        children: &[
            MenuItem {
                key: "classes",
                label: "Classes",
                href: "/classes",
                roles: &[Admin, Teacher],
                children: &[],
            },
            MenuItem {
                key: "students",
                label: "Students",
                href: "/students",
                roles: &[Admin, Teacher],
                children: &[],
            },
            MenuItem {
                key: "attendance",
                label: "Attendance",
                href: "/attendance",
                roles: &[Admin, Teacher],
                children: &[],
            },
        ],
    },
    MenuItem {
        key: "my-attendance",
        label: "My Attendance",
        href: "/me/attendance",
        roles: &[Student, Parent],
        children: &[],
    },
    MenuItem {
        key: "finance",
        label: "Finance",
        href: "",
        roles: &[Admin, Accountant, Parent],
        children: &[
            MenuItem {
                key: "fee-heads",
                label: "Fee Structure",
                href: "/fees/heads",
                roles: &[Admin, Accountant],
                children: &[],
            },
            MenuItem {
                key: "fee-collection",
                label: "Collect Fees",
                href: "/fees/collect",
                roles: &[Admin, Accountant],
                children: &[],
            },
            MenuItem {
                key: "fee-dues",
                label: "Fee Dues",
                href: "/fees/dues",
                roles: &[Admin, Accountant, Parent],
                children: &[],
            },
            MenuItem {
                key: "accounts",
                label: "Accounts",
                href: "/accounts",
                roles: &[Admin, Accountant],
                children: &[],
            },
        ],
    },
    MenuItem {
        key: "hr",
        label: "HR",
        href: "",
        roles: &[Admin, Accountant],
        children: &[
            MenuItem {
                key: "employees",
                label: "Employees",
                href: "/employees",
                roles: &[Admin],
                children: &[],
            },
            MenuItem {
                key: "payroll",
                label: "Payroll",
                href: "/payroll",
                roles: &[Admin, Accountant],
                children: &[],
            },
        ],
    },
    MenuItem {
        key: "inventory",
        label: "Inventory",
        href: "",
        roles: &[Admin, InventoryManager],
        children: &[
            MenuItem {
                key: "inventory-items",
                label: "Items",
                href: "/inventory/items",
                roles: &[Admin, InventoryManager],
                children: &[],
            },
            MenuItem {
                key: "inventory-stock",
                label: "Stock Movements",
                href: "/inventory/movements",
                roles: &[Admin, InventoryManager],
                children: &[],
            },
        ],
    },
    MenuItem {
        key: "messages",
        label: "Messages",
        href: "/messages",
        roles: &[],
        children: &[],
    },
    MenuItem {
        key: "calendar",
        label: "Calendar",
        href: "/calendar",
        roles: &[],
        children: &[],
    },
    MenuItem {
        key: "reports",
        label: "Reports",
        href: "",
        roles: STAFF,
        children: &[
            MenuItem {
                key: "report-attendance",
                label: "Attendance Report",
                href: "/reports/attendance",
                roles: &[Admin, Teacher],
                children: &[],
            },
            MenuItem {
                key: "report-fees",
                label: "Fee Collection",
                href: "/reports/fees",
                roles: &[Admin, Accountant],
                children: &[],
            },
        ],
    },
    MenuItem {
        key: "schools",
        label: "Schools",
        href: "/schools",
        roles: &[SuperAdmin],
        children: &[],
    },
    MenuItem {
        key: "users",
        label: "Users",
        href: "/users",
        roles: &[Admin],
        children: &[],
    },
];

fn visible(item: &MenuItem, roles: &RoleFlags) -> bool {
    if roles.is_super_admin {
        return true;
    }
    if item.roles.is_empty() {
        return roles.any();
    }
    item.roles.iter().any(|r| roles.has(*r))
}

fn filter_items(items: &[MenuItem], roles: &RoleFlags) -> Vec<MenuNode> {
    items
        .iter()
        .filter(|item| visible(item, roles))
        .filter_map(|item| {
            let children = filter_items(item.children, roles);
            if !item.children.is_empty() && children.is_empty() {
                return None;
            }
            Some(MenuNode {
                key: item.key.to_string(),
                label: item.label.to_string(),
                href: item.href.to_string(),
                children,
            })
        })
        .collect()
}

pub fn menu_for(roles: &RoleFlags) -> Vec<MenuNode> {
    filter_items(MENU, roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(nodes: &[MenuNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.key.as_str()).collect()
    }

    #[test]
    fn no_roles_sees_nothing() {
        assert!(menu_for(&RoleFlags::default()).is_empty());
    }

    #[test]
    fn super_admin_sees_full_tree_in_order() {
        let m = menu_for(&RoleFlags {
            is_super_admin: true,
            ..Default::default()
        });
        assert_eq!(keys(&m), MENU.iter().map(|i| i.key).collect::<Vec<_>>());
    }

    #[test]
    fn accountant_gets_finance_and_payroll_only() {
        let m = menu_for(&RoleFlags {
            is_accountant: true,
            ..Default::default()
        });
        assert_eq!(
            keys(&m),
            vec!["dashboard", "finance", "hr", "messages", "calendar", "reports"]
        );
        let hr = m.iter().find(|n| n.key == "hr").unwrap();
        assert_eq!(keys(&hr.children), vec!["payroll"]);
        let reports = m.iter().find(|n| n.key == "reports").unwrap();
        assert_eq!(keys(&reports.children), vec!["report-fees"]);
    }

    #[test]
    fn parent_finance_group_keeps_only_dues() {
        let m = menu_for(&RoleFlags {
            is_parent: true,
            ..Default::default()
        });
        let finance = m.iter().find(|n| n.key == "finance").unwrap();
        assert_eq!(keys(&finance.children), vec!["fee-dues"]);
        assert!(m.iter().all(|n| n.key != "reports"));
    }

    #[test]
    fn inventory_manager_drops_empty_report_group() {
        let m = menu_for(&RoleFlags {
            is_inventory_manager: true,
            ..Default::default()
        });
        // The reports group admits inventory managers but none of its children do.
        assert!(m.iter().all(|n| n.key != "reports"));
        assert!(m.iter().any(|n| n.key == "inventory"));
    }
}
