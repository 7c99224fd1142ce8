use boardstack::core::store::Store;
use boardstack::plugins::board::{BoardStore, Role, verify_password};
use boardstack::plugins::seed::{
    self, ADMIN_EMAIL, ADMIN_PASSWORD, DEFAULT_LISTS, SEED_PASSWORD, SeedOptions, SeedSummary,
};
use tempfile::tempdir;

#[test]
fn default_seed_populates_every_table() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());

    let summary = seed::seed(&store, &SeedOptions::default()).unwrap();
    assert_eq!(
        summary,
        SeedSummary {
            users_created: 10,
            users_skipped: 0,
            boards_created: 5,
            boards_skipped: 0,
            lists_created: 20,
            cards_created: 60,
            members_added: 10,
            assignments_created: 40,
        }
    );

    let boards = BoardStore::open(&store).unwrap();
    assert_eq!(boards.list_users(false).unwrap().len(), 10);
    let admin = boards.get_user_by_email(ADMIN_EMAIL).unwrap().unwrap();
    assert!(admin.is_superuser);
    assert_eq!(admin.username, "admin");
    let regular = boards.get_user_by_email(&seed::seed_email(0)).unwrap().unwrap();
    assert!(!regular.is_superuser);

    // Stored hashes are salted argon2 strings the app tier can verify.
    assert!(admin.hashed_password.starts_with("$argon2id$"));
    assert!(verify_password(ADMIN_PASSWORD, &admin.hashed_password).unwrap());
    assert!(verify_password(SEED_PASSWORD, &regular.hashed_password).unwrap());
    let other = boards.get_user_by_email(&seed::seed_email(1)).unwrap().unwrap();
    assert_ne!(regular.hashed_password, other.hashed_password);
}

#[test]
fn boards_get_the_standard_lists_and_three_participants() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    seed::seed(&store, &SeedOptions::default()).unwrap();

    let boards = BoardStore::open(&store).unwrap();
    let all = boards.list_boards(None).unwrap();
    assert_eq!(all.len(), 5);
    for board in &all {
        let titles: Vec<String> = boards
            .list_lists(&board.id)
            .unwrap()
            .into_iter()
            .map(|l| l.title)
            .collect();
        assert_eq!(titles, DEFAULT_LISTS);

        let members = boards.list_members(&board.id).unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(
            members.iter().filter(|m| m.role == Role::Owner).count(),
            1,
            "{}",
            board.title
        );

        let summary = boards.board_summary(&board.id).unwrap();
        assert_eq!(summary.cards, 12);
    }
}

#[test]
fn reseeding_adds_nothing() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    seed::seed(&store, &SeedOptions::default()).unwrap();

    let again = seed::seed(&store, &SeedOptions::default()).unwrap();
    assert_eq!(again.users_created, 0);
    assert_eq!(again.users_skipped, 10);
    assert_eq!(again.boards_created, 0);
    assert_eq!(again.boards_skipped, 5);
    assert_eq!(again.cards_created, 0);

    let boards = BoardStore::open(&store).unwrap();
    assert_eq!(boards.list_boards(None).unwrap().len(), 5);
}

#[test]
fn seeding_is_deterministic_across_stores() {
    let shape = |dir: &std::path::Path| {
        let store = Store::new(dir);
        seed::seed(
            &store,
            &SeedOptions {
                users: 3,
                boards: 7,
                cards_per_list: 2,
            },
        )
        .unwrap();
        let boards = BoardStore::open(&store).unwrap();
        let mut out = Vec::new();
        for board in boards.list_boards(None).unwrap() {
            for list in boards.list_lists(&board.id).unwrap() {
                for card in boards.list_cards(&list.id).unwrap() {
                    out.push((
                        board.title.clone(),
                        list.title.clone(),
                        card.title,
                        card.priority,
                        card.labels.as_slice().to_vec(),
                        card.due_date,
                    ));
                }
            }
        }
        out.sort_by(|a, b| (&a.0, &a.2).cmp(&(&b.0, &b.2)));
        out
    };

    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let first = shape(a.path());
    assert_eq!(first.len(), 7 * 4 * 2);
    assert_eq!(first, shape(b.path()));
}
