//! Essential-graph optimization for loop closing.
//!
//! One Sim3 variable per keyframe (the loop keyframe fixed) linked by
//! relative-Sim3 constraints: the new loop connections, the spanning tree,
//! previously closed loops and strong covisibility links. After solving,
//! keyframe poses get the scale folded into the translation and every map
//! point follows its reference keyframe's correction.
//!
//! Phases:
//! 1. COLLECT: snapshot poses, edges and points under the read lock
//! 2. SOLVE: LM over the Sim3 graph, no lock held
//! 3. APPLY: write poses and points under one write guard

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OptimError, OptimResult};
use crate::geometry::{Sim3, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

use super::factors::{Factor, FactorKind};
use super::graph::Graph;
use super::solver::{total_cost, LevenbergMarquardt, SolverConfig};
use super::variables::{Estimate, Variable, VariableId};

/// Configuration for essential-graph optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EssentialGraphConfig {
    pub iterations: usize,

    /// Covisibility weight needed for loop-connection and covisibility edges.
    pub min_covisibility_weight: usize,

    pub solver: SolverConfig,
}

impl Default for EssentialGraphConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            min_covisibility_weight: 100,
            solver: SolverConfig {
                initial_lambda: Some(1e-16),
                ..SolverConfig::default()
            },
        }
    }
}

/// What the loop closer hands over after computing the loop correction.
#[derive(Debug, Clone)]
pub struct LoopClosureInput {
    pub loop_kf: KeyFrameId,
    pub current_kf: KeyFrameId,

    /// S_iw of the corrected keyframes before correction.
    pub non_corrected: HashMap<KeyFrameId, Sim3>,

    /// Corrected S_iw of the keyframes around the current keyframe.
    pub corrected: HashMap<KeyFrameId, Sim3>,

    /// Covisibility links created by fusing the loop.
    pub loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>>,

    /// Keep every scale at 1 (stereo / RGB-D).
    pub fix_scale: bool,
}

/// Origin of an essential-graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Created by the loop being closed.
    LoopConnection,
    SpanningTree,
    /// Closed in an earlier loop.
    LoopClosure,
    Covisibility,
}

/// Relative constraint: `measurement` is S_ji.
#[derive(Debug, Clone)]
pub struct EssentialEdge {
    pub kf_i: KeyFrameId,
    pub kf_j: KeyFrameId,
    pub measurement: Sim3,
    pub edge_type: EdgeType,
}

/// Snapshot for the essential graph.
#[derive(Debug, Clone)]
pub struct EssentialGraphProblem {
    /// Initial S_iw of every valid keyframe, sorted by id.
    pub poses: Vec<(KeyFrameId, Sim3)>,
    pub edges: Vec<EssentialEdge>,
    /// Map points with the keyframe whose correction they follow.
    pub points: Vec<(MapPointId, Vector3<f64>, KeyFrameId)>,
    pub fixed_kf: KeyFrameId,
    pub fix_scale: bool,
}

impl EssentialGraphProblem {
    pub fn count_edges(&self, edge_type: EdgeType) -> usize {
        self.edges.iter().filter(|e| e.edge_type == edge_type).count()
    }
}

/// Corrected state, ready to be written back.
#[derive(Debug, Clone)]
pub struct EssentialGraphResult {
    /// Corrected T_wc of every keyframe.
    pub corrected_poses: HashMap<KeyFrameId, SE3>,
    pub corrected_points: HashMap<MapPointId, Vector3<f64>>,
    pub num_edges: usize,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

fn unordered(a: KeyFrameId, b: KeyFrameId) -> (KeyFrameId, KeyFrameId) {
    (a.min(b), a.max(b))
}

/// PHASE 1: Collect the essential graph.
pub fn collect_essential_graph(
    map: &Map,
    input: &LoopClosureInput,
    config: &EssentialGraphConfig,
) -> OptimResult<EssentialGraphProblem> {
    for id in [input.loop_kf, input.current_kf] {
        if !map.get_keyframe(id).is_some_and(|kf| !kf.is_bad) {
            return Err(OptimError::UnknownKeyFrame(id));
        }
    }

    let mut kfs: Vec<_> = map.keyframes().filter(|kf| !kf.is_bad).collect();
    kfs.sort_by_key(|kf| kf.id);

    // Graph estimates: corrected where available.
    let scw: HashMap<KeyFrameId, Sim3> = kfs
        .iter()
        .map(|kf| {
            let s = input
                .corrected
                .get(&kf.id)
                .cloned()
                .unwrap_or_else(|| Sim3::from_se3(&kf.pose_cw()));
            (kf.id, s)
        })
        .collect();
    // Edge measurements: uncorrected where available.
    let uncorrected = |id: KeyFrameId| input.non_corrected.get(&id).or_else(|| scw.get(&id));

    let min_weight = config.min_covisibility_weight;
    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();

    let mut connected: Vec<_> = input.loop_connections.iter().collect();
    connected.sort_by_key(|(id, _)| **id);
    for (&kf_i, connections) in connected {
        let (Some(kf), Some(s_iw)) = (map.get_keyframe(kf_i), scw.get(&kf_i)) else {
            continue;
        };
        let s_wi = s_iw.inverse();
        let mut connections: Vec<_> = connections.iter().copied().collect();
        connections.sort();
        for kf_j in connections {
            let primary = kf_i == input.current_kf && kf_j == input.loop_kf;
            if !primary && kf.get_covisibility_weight(kf_j) < min_weight {
                continue;
            }
            let Some(s_jw) = scw.get(&kf_j) else {
                continue;
            };
            edges.push(EssentialEdge {
                kf_i,
                kf_j,
                measurement: s_jw.compose(&s_wi),
                edge_type: EdgeType::LoopConnection,
            });
            inserted.insert(unordered(kf_i, kf_j));
        }
    }

    for kf in &kfs {
        let Some(s_wi) = uncorrected(kf.id).map(Sim3::inverse) else {
            continue;
        };
        let mut relative = |kf_j: KeyFrameId, edge_type: EdgeType| {
            if let Some(s_jw) = uncorrected(kf_j) {
                edges.push(EssentialEdge {
                    kf_i: kf.id,
                    kf_j,
                    measurement: s_jw.compose(&s_wi),
                    edge_type,
                });
            }
        };

        if let Some(parent) = kf.parent_id.filter(|id| scw.contains_key(id)) {
            relative(parent, EdgeType::SpanningTree);
        }

        let mut loop_edges: Vec<_> = kf.loop_edges.iter().copied().filter(|id| *id < kf.id).collect();
        loop_edges.sort();
        for kf_l in loop_edges {
            relative(kf_l, EdgeType::LoopClosure);
        }

        for kf_n in kf.covisibles_above_weight(min_weight) {
            let skip = Some(kf_n) == kf.parent_id
                || kf.children_ids.contains(&kf_n)
                || kf.loop_edges.contains(&kf_n)
                || kf_n >= kf.id
                || !scw.contains_key(&kf_n)
                || inserted.contains(&unordered(kf.id, kf_n));
            if !skip {
                relative(kf_n, EdgeType::Covisibility);
            }
        }
    }

    let points = map
        .map_points()
        .filter(|mp| !mp.is_bad)
        .map(|mp| {
            let reference = match mp.corrected_by_kf {
                Some(id) if id == input.current_kf => mp.corrected_reference.unwrap_or(mp.reference_kf_id),
                _ => mp.reference_kf_id,
            };
            (mp.id, mp.position, reference)
        })
        .collect();

    Ok(EssentialGraphProblem {
        poses: kfs.iter().filter_map(|kf| Some((kf.id, scw.get(&kf.id)?.clone()))).collect(),
        edges,
        points,
        fixed_kf: input.loop_kf,
        fix_scale: input.fix_scale,
    })
}

/// PHASE 2: Solve the essential graph and propagate the correction to points.
pub fn solve_essential_graph(
    problem: &EssentialGraphProblem,
    config: &EssentialGraphConfig,
) -> OptimResult<EssentialGraphResult> {
    let mut graph = Graph::new();
    let mut vars: HashMap<KeyFrameId, VariableId> = HashMap::new();
    for (kf_id, s_iw) in &problem.poses {
        let var = Variable::new(Estimate::Sim3(s_iw.clone()))
            .fixed(*kf_id == problem.fixed_kf)
            .with_fix_scale(problem.fix_scale);
        vars.insert(*kf_id, graph.add_variable(var));
    }

    for edge in &problem.edges {
        let (Some(&v_i), Some(&v_j)) = (vars.get(&edge.kf_i), vars.get(&edge.kf_j)) else {
            continue;
        };
        graph.add_factor(Factor::new(
            FactorKind::Sim3Relative {
                measurement: edge.measurement.clone(),
            },
            vec![v_i, v_j],
        ))?;
    }

    let solver = LevenbergMarquardt::new(config.solver.clone());
    let summary = solver.optimize(&mut graph, config.iterations, &|| false);

    let initial: HashMap<KeyFrameId, &Sim3> = problem.poses.iter().map(|(id, s)| (*id, s)).collect();
    let mut corrected_swc: HashMap<KeyFrameId, Sim3> = HashMap::new();
    let mut corrected_poses = HashMap::new();
    for (kf_id, var) in &vars {
        let Some(s_iw) = graph.estimate(*var).and_then(Estimate::as_sim3) else {
            continue;
        };
        corrected_poses.insert(*kf_id, s_iw.to_se3_unscaled().inverse());
        corrected_swc.insert(*kf_id, s_iw.inverse());
    }

    let mut corrected_points = HashMap::new();
    for (mp_id, position, reference) in &problem.points {
        let (Some(s_rw), Some(s_wr)) = (initial.get(reference), corrected_swc.get(reference)) else {
            debug!("map point {:?}: reference {} not in the essential graph", mp_id, reference);
            continue;
        };
        corrected_points.insert(*mp_id, s_wr.transform_point(&s_rw.transform_point(position)));
    }

    Ok(EssentialGraphResult {
        corrected_poses,
        corrected_points,
        num_edges: graph.num_factors(),
        iterations: summary.iterations,
        initial_error: summary.initial_cost,
        final_error: total_cost(&graph),
    })
}

/// PHASE 3: Write corrected poses and points. Returns the number of updates.
pub fn apply_essential_graph(map: &mut Map, result: &EssentialGraphResult) -> usize {
    let mut updated = 0;
    for (kf_id, pose) in &result.corrected_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.pose = pose.clone();
            updated += 1;
        }
    }
    for (mp_id, position) in &result.corrected_points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            mp.position = *position;
            updated += 1;
        }
    }
    updated
}

/// Correct the whole map after a loop closure.
pub fn optimize_essential_graph(
    map: &RwLock<Map>,
    input: &LoopClosureInput,
    config: &EssentialGraphConfig,
) -> OptimResult<EssentialGraphResult> {
    let problem = {
        let guard = map.read();
        collect_essential_graph(&guard, input, config)?
    };

    let result = solve_essential_graph(&problem, config)?;

    let updated = {
        let mut guard = map.write();
        apply_essential_graph(&mut guard, &result)
    };

    info!(
        "Essential graph: {} KFs, {} edges ({} loop, {} tree, {} covisibility), error {:.6} -> {:.6}, {} updates",
        problem.poses.len(),
        result.num_edges,
        problem.count_edges(EdgeType::LoopConnection) + problem.count_edges(EdgeType::LoopClosure),
        problem.count_edges(EdgeType::SpanningTree),
        problem.count_edges(EdgeType::Covisibility),
        result.initial_error,
        result.final_error,
        updated
    );

    Ok(result)
}
