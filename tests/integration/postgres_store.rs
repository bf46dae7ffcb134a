//! Postgres record store tests
//!
//! Need a disposable database: `DATABASE_URL=postgres://... cargo test -- --ignored`

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use elidune_lending::{
    error::{InvariantError, PolicyViolation},
    models::{BorrowRequest, CreateBook, CreateDomain, CreateEdition, CreateReader, Reader},
    AppConfig, AppError, LendingState,
};

async fn state() -> LendingState {
    let mut config = AppConfig::default();
    config.database.url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    LendingState::connect(config).await.expect("Failed to connect")
}

async fn reader(state: &LendingState) -> Reader {
    state
        .services
        .readers
        .create(&CreateReader {
            firstname: "Petru".into(),
            lastname: "Rares".into(),
            address: None,
            email: None,
            phone: Some("0233000111".into()),
            is_employee: false,
        })
        .await
        .expect("Failed to create reader")
}

fn book(domain_id: i32, total: i32) -> CreateBook {
    CreateBook {
        title: "Letopisetul Tarii Moldovei".into(),
        edition: CreateEdition {
            publisher: "Litera".into(),
            publication_year: Some(1990),
            isbn: None,
            pages: Some(300),
        },
        author_ids: vec![],
        domain_ids: vec![domain_id],
        total_copies: total,
        reading_room_copies: 0,
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_borrow_extend_return() {
    let state = state().await;
    let services = &state.services;
    let domain = assert_ok!(
        services
            .domains
            .create(&CreateDomain { name: "Chronicles".into(), parent_id: None })
            .await
    );
    let book = assert_ok!(services.catalog.create_book(&book(domain.id, 4)).await);
    let reader = reader(&state).await;

    let loan = assert_ok!(
        services
            .lending
            .borrow(&BorrowRequest { reader_id: reader.id, book_ids: vec![book.id], issued_by: None })
            .await
    )
    .remove(0);
    assert_eq!(assert_ok!(services.catalog.get_book(book.id).await).available_copies, 3);

    let extended = assert_ok!(services.lending.extend(loan.id, 4).await);
    let extended = assert_ok!(services.lending.extend(extended.id, 6).await);
    assert_eq!(
        extended.borrow_end_extended,
        Some(loan.borrow_end + chrono::Duration::days(10))
    );
    assert_eq!(assert_ok!(services.readers.get(reader.id).await).number_of_extensions, 2);

    assert_ok!(services.lending.return_book(reader.id, book.id).await);
    assert_eq!(assert_ok!(services.catalog.get_book(book.id).await).available_copies, 4);
    let err = assert_err!(services.lending.return_book(reader.id, book.id).await);
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_borrows_of_last_copy() {
    let state = state().await;
    let domain = assert_ok!(
        state
            .services
            .domains
            .create(&CreateDomain { name: "Rare books".into(), parent_id: None })
            .await
    );
    let book = assert_ok!(state.services.catalog.create_book(&book(domain.id, 1)).await);

    let book_id = book.id;
    let mut handles = Vec::new();
    for _ in 0..4 {
        let reader = reader(&state).await;
        let services = Arc::clone(&state.services);
        handles.push(tokio::spawn(async move {
            services
                .lending
                .borrow(&BorrowRequest { reader_id: reader.id, book_ids: vec![book_id], issued_by: None })
                .await
        }));
    }

    let mut granted = 0;
    for handle in handles {
        match handle.await.expect("borrow task panicked") {
            Ok(_) => granted += 1,
            Err(AppError::PolicyViolation(PolicyViolation::NoAvailableCopies { .. }))
            | Err(AppError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(
        assert_ok!(state.services.catalog.get_book(book_id).await).available_copies,
        0
    );
}

#[tokio::test]
#[ignore]
async fn test_domain_cycle_refused() {
    let state = state().await;
    let domains = &state.services.domains;
    let top = assert_ok!(domains.create(&CreateDomain { name: "Arts".into(), parent_id: None }).await);
    let mid = assert_ok!(
        domains
            .create(&CreateDomain { name: "Visual arts".into(), parent_id: Some(top.id) })
            .await
    );
    let leaf = assert_ok!(
        domains
            .create(&CreateDomain { name: "Painting".into(), parent_id: Some(mid.id) })
            .await
    );

    let err = assert_err!(domains.set_parent(top.id, Some(leaf.id)).await);
    assert!(matches!(err, AppError::Invariant(InvariantError::Cycle { .. })));
    assert!(assert_ok!(domains.is_ancestor(top.id, leaf.id).await));
    assert_eq!(assert_ok!(domains.descendants(top.id).await), vec![mid.id, leaf.id]);
}
