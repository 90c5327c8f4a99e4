use shuttlecore::DagScheduler;

#[test]
fn cyclic_dag_is_rejected_at_submit() {
    // 0 -> 1 -> 2 -> 0
    let result = DagScheduler::new(vec![vec![1], vec![2], vec![0]]);
    assert!(result.is_err());
}

#[test]
fn acyclic_dag_drains_to_zero_unfinished_respecting_predecessor_order() {
    // 0 -> 1, 0 -> 2, {1, 2} -> 3
    let mut dag = DagScheduler::new(vec![vec![1, 2], vec![3], vec![3], vec![]]).unwrap();
    assert_eq!(dag.available_nodes(), vec![0]);

    let mut removed_order = Vec::new();
    let mut frontier = dag.available_nodes();
    while !frontier.is_empty() {
        let node = frontier.remove(0);
        removed_order.push(node);
        let newly_available = dag.remove_finished_node(node).unwrap();
        frontier.extend(newly_available);
    }

    assert_eq!(dag.unfinished_nodes(), 0);
    assert_eq!(removed_order[0], 0);
    let pos3 = removed_order.iter().position(|&n| n == 3).unwrap();
    let pos1 = removed_order.iter().position(|&n| n == 1).unwrap();
    let pos2 = removed_order.iter().position(|&n| n == 2).unwrap();
    assert!(pos1 < pos3 && pos2 < pos3);
}
