//! visiting every reachable node of a configuration
//!
//! Nodes are discovered breadth first from the root stack, following the expansion of each
//! embedded stack in the walked phase. Each node then runs in its own task; requests between
//! them are coordinated by the per-phase promises.
use crate::diagnostics::Diagnostics;
use crate::engine::Main;
use crate::eval::{Outcome, Plannable, Validatable, Walkable};
use crate::phase::EvalPhase;
use crate::plan::ResourceInstanceChange;
use crate::promising::{self, CancelToken, Canceled};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

/// Validates every node, collecting all diagnostics
pub async fn validate_all(main: Arc<Main>, cancel: CancelToken) -> Result<Diagnostics, Canceled> {
    promising::main_task(cancel, async move {
        let results = for_each_node(&main, EvalPhase::Validate, |main, node| async move {
            node.validate(&main).await
        })
        .await?;

        let mut diags = Diagnostics::new();
        for result in results {
            diags.append(result);
        }
        Ok(diags)
    })
    .await
}

/// Plans every node, collecting the proposed changes and all diagnostics
pub async fn plan_all(
    main: Arc<Main>,
    cancel: CancelToken,
) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
    promising::main_task(cancel, async move {
        let results = for_each_node(&main, EvalPhase::Plan, |main, node| async move {
            node.plan_changes(&main).await
        })
        .await?;

        let mut changes = vec![];
        let mut diags = Diagnostics::new();
        for (more_changes, more_diags) in results {
            changes.extend(more_changes);
            diags.append(more_diags);
        }
        Ok((changes, diags))
    })
    .await
}

/// Runs `visit` for every node reachable in `phase`, results in discovery order
async fn for_each_node<F, Fut, T>(main: &Arc<Main>, phase: EvalPhase, visit: F) -> Result<Vec<T>, Canceled>
where
    F: Fn(Arc<Main>, Arc<dyn Walkable>) -> Fut,
    Fut: Future<Output = Result<T, Canceled>> + Send + 'static,
    T: Send + 'static,
{
    let nodes = reachable_nodes(main, phase).await?;
    tracing::debug!(%phase, nodes = nodes.len(), "walking");

    let handles: Vec<_> = nodes
        .into_iter()
        .map(|node| promising::spawn(visit(Arc::clone(main), node)))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(result) => results.push(result?),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => return Err(Canceled),
        }
    }
    Ok(results)
}

async fn reachable_nodes(main: &Main, phase: EvalPhase) -> Result<Vec<Arc<dyn Walkable>>, Canceled> {
    let mut nodes: Vec<Arc<dyn Walkable>> = vec![];
    let mut queue = VecDeque::from([main.root_stack()]);

    while let Some(stack) = queue.pop_front() {
        for node in stack.input_variables() {
            nodes.push(Arc::clone(node) as Arc<dyn Walkable>);
        }
        for node in stack.local_values() {
            nodes.push(Arc::clone(node) as Arc<dyn Walkable>);
        }
        for node in stack.output_values() {
            nodes.push(Arc::clone(node) as Arc<dyn Walkable>);
        }

        for call in stack.stack_calls() {
            nodes.push(Arc::clone(call) as Arc<dyn Walkable>);

            let expansion = call.check_expansion(main, phase).await?;
            // deferred and failed expansions have no instances to visit
            let Outcome::Resolved(keys) = &expansion.outcome else {
                continue;
            };
            for key in keys {
                let instance = call.instance(*key);
                if let Some(child) = main.stack_node(&instance.addr().child_stack()) {
                    queue.push_back(child);
                }
                nodes.push(instance as Arc<dyn Walkable>);
            }
        }
    }

    Ok(nodes)
}
