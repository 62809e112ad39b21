//! Query API behaviour over a populated mirror: pagination laws, ordering,
//! snapshot stability, caps, and future-block reads.

mod common;

use alloy_primitives::{Address, B256};
use arkiv_index::{ChainBlock, IngestError, OrderBy, Projection, QueryError, QueryOptions};
use common::*;
use tokio_util::sync::CancellationToken;

async fn populated_chain(entities: u64) -> TestChain {
    let mut chain = TestChain::new().await;
    for index in 0..entities {
        chain
            .produce_block(vec![(
                alice(),
                create_batch(
                    1000,
                    format!("payload {index}").as_bytes(),
                    &[("tag", "fleet"), ("name", &format!("item_{index}"))],
                    &[("rank", index)],
                ),
            )])
            .await;
    }
    chain
}

#[test_log::test(tokio::test)]
async fn paging_concatenates_to_the_unbounded_result() {
    let chain = populated_chain(7).await;
    let unbounded = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(unbounded.data.len(), 7);
    assert!(unbounded.cursor.is_none());

    let mut options = QueryOptions {
        results_per_page: 2,
        ..Default::default()
    };
    let mut collected = Vec::new();
    let mut pages = 0;
    loop {
        let page = chain
            .api
            .query(r#"tag = "fleet""#, &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(page.data.len() <= 2);
        collected.extend(page.data);
        pages += 1;
        match page.cursor {
            Some(cursor) => options.cursor = Some(cursor),
            None => break,
        }
        assert!(pages < 10, "cursor chain does not terminate");
    }
    assert_eq!(collected, unbounded.data);
    assert_eq!(pages, 4);
}

#[test_log::test(tokio::test)]
async fn cursor_pins_the_snapshot_block() {
    let mut chain = populated_chain(3).await;
    let first_page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions {
                results_per_page: 2,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let cursor = first_page.cursor.unwrap();

    // A fourth matching entity lands after the first page was served.
    chain
        .produce_block(vec![(
            alice(),
            create_batch(1000, b"late arrival", &[("tag", "fleet")], &[]),
        )])
        .await;

    let second_page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions {
                results_per_page: 2,
                cursor: Some(cursor),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    // The pinned at-block hides the late arrival: 3 results total.
    assert_eq!(second_page.block_number, first_page.block_number);
    assert_eq!(second_page.data.len(), 1);
    assert!(second_page.cursor.is_none());

    // A fresh unbounded query at the new head sees all four.
    let fresh = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(fresh.data.len(), 4);
}

#[test_log::test(tokio::test)]
async fn order_by_annotation_descending() {
    let chain = populated_chain(4).await;
    let page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions {
                order_by: vec![OrderBy {
                    name: "rank".into(),
                    numeric: true,
                    descending: true,
                }],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let ranks: Vec<u64> = page
        .data
        .iter()
        .map(|entity| {
            entity
                .numeric_annotations
                .as_ref()
                .unwrap()
                .iter()
                .find(|a| a.key == "rank")
                .unwrap()
                .value
        })
        .collect();
    assert_eq!(ranks, vec![3, 2, 1, 0]);
}

#[test_log::test(tokio::test)]
async fn glob_owner_and_all_queries() {
    let chain = populated_chain(3).await;
    let cancel = CancellationToken::new();

    let glob = chain
        .api
        .query(r#"name ~ "item_*""#, &QueryOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(glob.data.len(), 3);

    let miss = chain
        .api
        .query(r#"name GLOB "other_*""#, &QueryOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(miss.data.is_empty());

    let owner = format!("{:#x}", alice());
    let owned = chain
        .api
        .query(
            &format!(r#"$owner = "{owner}" && tag = "fleet""#),
            &QueryOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(owned.data.len(), 3);

    let nobody = chain
        .api
        .query(
            &format!(r#"$owner = "{:#x}""#, Address::repeat_byte(0xee)),
            &QueryOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert!(nobody.data.is_empty());

    let all = chain
        .api
        .query("$all", &QueryOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(all.data.len(), 3);
}

#[test_log::test(tokio::test)]
async fn not_in_and_range_queries() {
    let chain = populated_chain(5).await;
    let cancel = CancellationToken::new();

    let upper = chain
        .api
        .query("rank >= 3", &QueryOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(upper.data.len(), 2);

    let excluded = chain
        .api
        .query(
            r#"tag = "fleet" && name NOT IN ("item_0" "item_1")"#,
            &QueryOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(excluded.data.len(), 3);

    let negated = chain
        .api
        .query(
            r#"tag = "fleet" && NOT (rank < 2)"#,
            &QueryOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(negated.data.len(), 3);
}

#[test_log::test(tokio::test)]
async fn response_size_cap_truncates_with_cursor() {
    let mut chain = TestChain::new().await;
    // Payloads of ~200 KiB each: three of them cannot fit the 512 KiB
    // page ceiling.
    for index in 0..3u8 {
        chain
            .produce_block(vec![(
                alice(),
                create_batch(1000, &vec![index; 200 * 1024], &[("big", "yes")], &[]),
            )])
            .await;
    }
    let first = chain
        .api
        .query(
            r#"big = "yes""#,
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(first.data.len() < 3);
    let mut seen = first.data.len();
    let mut cursor = first.cursor.expect("truncated page must carry a cursor");
    loop {
        let page = chain
            .api
            .query(
                r#"big = "yes""#,
                &QueryOptions {
                    cursor: Some(cursor),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        seen += page.data.len();
        match page.cursor {
            Some(next) => cursor = next,
            None => break,
        }
    }
    assert_eq!(seen, 3);
}

#[test_log::test(tokio::test)]
async fn projection_excludes_unrequested_columns() {
    let chain = populated_chain(1).await;
    let page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions {
                include: Projection {
                    key: true,
                    last_modified_at_block: true,
                    ..Projection::default()
                },
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let entity = &page.data[0];
    assert!(entity.key.is_some());
    assert_eq!(entity.last_modified_at_block, Some(1));
    assert!(entity.payload.is_none());
    assert!(entity.owner.is_none());
    assert!(entity.string_annotations.is_none());
}

#[test_log::test(tokio::test)]
async fn synthetic_annotations_hydrate_on_request() {
    let chain = populated_chain(1).await;
    let mut include = Projection::all();
    include.synthetic_attributes = true;
    let page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions {
                include,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let strings = page.data[0].string_annotations.as_ref().unwrap();
    assert!(strings.iter().any(|a| a.key == "$owner"));
    assert!(strings.iter().any(|a| a.key == "$key"));

    // Default hydration filters the synthetic rows out.
    let page = chain
        .api
        .query(
            r#"tag = "fleet""#,
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let strings = page.data[0].string_annotations.as_ref().unwrap();
    assert!(strings.iter().all(|a| !a.key.starts_with('$')));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn far_future_block_fails_after_the_wait_budget() {
    let chain = populated_chain(1).await;
    let err = chain
        .api
        .query(
            "$all",
            &QueryOptions {
                at_block: Some(1_000),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::FutureBlock));
    assert_eq!(err.to_string(), "requested block is in the future");
}

#[test_log::test(tokio::test)]
async fn cancelled_queries_abort_cleanly() {
    let chain = populated_chain(2).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = chain
        .api
        .query("$all", &QueryOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Cancelled));
}

#[test_log::test(tokio::test)]
async fn foreign_network_blocks_are_rejected() {
    let mut chain = TestChain::new().await;
    chain.produce_block(Vec::new()).await;

    let foreign = ChainBlock {
        chain_id: 1,
        number: 2,
        hash: B256::repeat_byte(2),
        parent_hash: chain.parent_hash,
        timestamp: GENESIS_TIME + 4,
        transactions: Vec::new(),
    };
    let err = chain
        .ingester
        .ingest(&foreign, &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::NetworkMismatch {
            bound: CHAIN_ID,
            got: 1
        }
    ));
}

#[test_log::test(tokio::test)]
async fn block_timing_and_used_slots_are_reported() {
    let chain = populated_chain(2).await;
    let timing = chain.api.block_timing();
    assert_eq!(timing.current_block, 2);
    assert_eq!(timing.current_block_time, GENESIS_TIME + 2 * BLOCK_CADENCE);
    assert_eq!(timing.duration.as_secs(), BLOCK_CADENCE);

    // 2 live version rows, each with 2 string + 1 numeric user annotations
    // plus 5 synthetics.
    let slots = chain.api.used_slots().await.unwrap();
    assert_eq!(slots, alloy_primitives::U256::from(2 * (1 + 3 + 5)));
}
