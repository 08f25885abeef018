//! End-to-end pool scenario from the node pool's specification: allocate
//! two blocks' worth of nodes, free them all, and check that only one
//! block survives the trim.

use ioctx_pool::NodePool;

#[test]
fn pool_trim_scenario() {
    let mut pool = NodePool::new(8, 64, 1);
    let real_num_nodes = pool.real_num_nodes();

    let nodes = pool.allocate_nodes(2 * real_num_nodes).expect("two blocks' worth");
    assert_eq!(pool.num_free_nodes(), 0);

    pool.deallocate_nodes(nodes);

    assert_eq!(pool.num_free_nodes(), real_num_nodes);
    assert_eq!(pool.totally_free_blocks(), 1);
}

#[test]
fn single_node_repeated_alloc_dealloc_stays_in_one_block() {
    let mut pool = NodePool::new(16, 4, 2);
    for _ in 0..10_000 {
        let node = pool.allocate_node().unwrap();
        pool.deallocate_node(node);
    }
    assert_eq!(pool.blocks_in_pool(), 1);
}

#[test]
fn deallocate_free_blocks_trims_highest_address_first() {
    let mut pool = NodePool::new(16, 32, 8);
    let real_num_nodes = pool.real_num_nodes();

    let nodes = pool.allocate_nodes(4 * real_num_nodes).unwrap();
    pool.deallocate_nodes(nodes);
    assert_eq!(pool.totally_free_blocks(), 4);

    pool.deallocate_free_blocks(2);
    assert_eq!(pool.totally_free_blocks(), 2);
    assert_eq!(pool.num_free_nodes(), 2 * real_num_nodes);
}
