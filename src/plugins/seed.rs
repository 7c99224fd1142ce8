//! Development data for the board store.
//!
//! Output is a pure function of the options: same counts, same rows (ids
//! and password salts aside). Users whose email already exists and boards whose owner already
//! has one with the same title are skipped, so seeding twice adds nothing.

use crate::core::error;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::board::{
    self, BoardStore, Labels, NewBoard, NewCard, NewUser, Priority, Role, User,
};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;

pub const ADMIN_EMAIL: &str = "admin@boardstack.local";
pub const SEED_DOMAIN: &str = "boardstack.local";
pub const ADMIN_PASSWORD: &str = "admin123";
pub const SEED_PASSWORD: &str = "password123";
pub const DEFAULT_LISTS: [&str; 4] = ["To Do", "In Progress", "Review", "Done"];

const BOARD_TITLES: [&str; 5] = [
    "Website Redesign",
    "Mobile App Development",
    "API Integration",
    "Database Migration",
    "User Authentication System",
];

const CARD_TITLES: [&str; 15] = [
    "Design landing page",
    "Implement user authentication",
    "Create database schema",
    "Write API documentation",
    "Set up CI/CD pipeline",
    "Fix login bug",
    "Add search functionality",
    "Optimize database queries",
    "Create user dashboard",
    "Implement file upload",
    "Add email notifications",
    "Write unit tests",
    "Update dependencies",
    "Refactor code structure",
    "Add logging system",
];

const LABEL_POOL: [&str; 6] = ["frontend", "backend", "bug", "feature", "urgent", "api"];

const BOARD_COLORS: [&str; 5] = ["#0079bf", "#d29034", "#519839", "#b04632", "#89609e"];

const MEMBER_ROLES: [Role; 3] = [Role::Admin, Role::Member, Role::Viewer];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedOptions {
    /// Regular users, not counting the admin.
    pub users: usize,
    /// Boards, owned by users in rotation.
    pub boards: usize,
    pub cards_per_list: usize,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            users: 9,
            boards: 5,
            cards_per_list: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub users_created: usize,
    pub users_skipped: usize,
    pub boards_created: usize,
    pub boards_skipped: usize,
    pub lists_created: usize,
    pub cards_created: usize,
    pub members_added: usize,
    pub assignments_created: usize,
}

pub fn seed_email(index: usize) -> String {
    format!("user{}@{}", index + 1, SEED_DOMAIN)
}

fn seed_labels(k: usize) -> Result<Labels, error::BoardstackError> {
    let count = k % 4;
    Labels::new((0..count).map(|j| LABEL_POOL[(k + j) % LABEL_POOL.len()]))
}

fn seed_due_date(k: usize) -> Option<String> {
    if k % 3 == 0 {
        None
    } else {
        Some(format!("2030-01-{:02}", 1 + k % 28))
    }
}

/// Hashes `password` only when the user is actually created.
fn ensure_user(
    boards: &BoardStore,
    mut new: NewUser,
    password: &str,
    summary: &mut SeedSummary,
) -> Result<User, error::BoardstackError> {
    if let Some(existing) = boards.get_user_by_email(&new.email)? {
        summary.users_skipped += 1;
        return Ok(existing);
    }
    new.hashed_password = board::hash_password(password)?;
    let user = boards.create_user(&new)?;
    summary.users_created += 1;
    Ok(user)
}

pub fn seed(store: &Store, opts: &SeedOptions) -> Result<SeedSummary, error::BoardstackError> {
    let boards = BoardStore::open(store)?.with_actor("seed");
    let mut summary = SeedSummary::default();

    let mut users = Vec::with_capacity(opts.users + 1);
    users.push(ensure_user(
        &boards,
        NewUser {
            email: ADMIN_EMAIL.to_string(),
            username: "admin".to_string(),
            full_name: Some("Admin User".to_string()),
            hashed_password: String::new(),
            is_superuser: true,
        },
        ADMIN_PASSWORD,
        &mut summary,
    )?);
    for i in 0..opts.users {
        let email = seed_email(i);
        users.push(ensure_user(
            &boards,
            NewUser {
                email,
                username: format!("user_{}", i + 1),
                full_name: Some(format!("Seed User {}", i + 1)),
                hashed_password: String::new(),
                is_superuser: false,
            },
            SEED_PASSWORD,
            &mut summary,
        )?);
    }

    let mut card_index = 0usize;
    for b in 0..opts.boards {
        let owner = &users[b % users.len()];
        let title = if b < BOARD_TITLES.len() {
            BOARD_TITLES[b].to_string()
        } else {
            format!("{} {}", BOARD_TITLES[b % BOARD_TITLES.len()], b / BOARD_TITLES.len() + 1)
        };

        let owned = boards.list_boards(Some(&owner.id))?;
        if owned.iter().any(|existing| existing.title == title) {
            summary.boards_skipped += 1;
            continue;
        }

        let created = boards.create_board(&NewBoard {
            title,
            description: Some(format!("Seeded board {} of {}", b + 1, opts.boards)),
            owner_id: owner.id.clone(),
            is_public: b % 2 == 0,
            background_color: Some(BOARD_COLORS[b % BOARD_COLORS.len()].to_string()),
        })?;
        summary.boards_created += 1;

        // Owner row comes from create_board; add the next two users.
        let mut participants = vec![owner.id.clone()];
        for offset in 1..=2 {
            let member = &users[(b + offset) % users.len()];
            if participants.contains(&member.id) {
                continue;
            }
            let role = MEMBER_ROLES[(b + offset) % MEMBER_ROLES.len()];
            boards.add_member(&created.id, &member.id, role)?;
            participants.push(member.id.clone());
            summary.members_added += 1;
        }

        for list_title in DEFAULT_LISTS {
            let list = boards.create_list(&created.id, list_title, None)?;
            summary.lists_created += 1;

            for _ in 0..opts.cards_per_list {
                let k = card_index;
                card_index += 1;
                let card = boards.create_card(&NewCard {
                    title: format!("{} #{}", CARD_TITLES[k % CARD_TITLES.len()], k + 1),
                    description: Some(format!("Seeded card {} on {}", k + 1, created.title)),
                    list_id: list.id.clone(),
                    position: None,
                    due_date: seed_due_date(k),
                    priority: Priority::ALL[k % Priority::ALL.len()],
                    labels: seed_labels(k)?,
                })?;
                summary.cards_created += 1;

                // Roughly two in three cards get an assignee from the board.
                if k % 3 != 2 {
                    boards.assign_card(&card.id, &participants[k % participants.len()])?;
                    summary.assignments_created += 1;
                }
            }
        }
    }

    Ok(summary)
}

#[derive(Parser, Debug)]
#[clap(name = "seed", about = "Populate the local board store with development data")]
pub struct SeedCli {
    /// Regular users to create (the admin is always added).
    #[clap(long, default_value_t = 9)]
    pub users: usize,
    #[clap(long, default_value_t = 5)]
    pub boards: usize,
    #[clap(long, default_value_t = 3)]
    pub cards_per_list: usize,
}

pub fn run_seed_cli(store: &Store, cli: SeedCli) -> Result<(), error::BoardstackError> {
    let summary = seed(
        store,
        &SeedOptions {
            users: cli.users,
            boards: cli.boards,
            cards_per_list: cli.cards_per_list,
        },
    )?;
    eprintln!(
        "{} {} users, {} boards, {} cards",
        "seeded".green().bold(),
        summary.users_created,
        summary.boards_created,
        summary.cards_created
    );
    let out = time::command_envelope("seed", "ok", json!({ "summary": summary }));
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
